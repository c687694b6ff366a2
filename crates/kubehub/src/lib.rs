//! harbor-sync kubehub: cluster collaborators (namespaces, secrets, sync
//! configurations and their status) and the configuration watcher.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use hsync_core::{HarborSync, HarborSyncStatus, WorkItem};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    runtime::watcher::{self, Event},
    Client, ResourceExt,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod crd_store;
mod fake;

pub use crd_store::{build_resource_name, CrdStore};
pub use fake::FakeCluster;

/// Field manager used for every server-side apply issued by this process.
pub const FIELD_MANAGER: &str = "harbor-sync";

/// What the reconcile engine needs from the cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn namespace_exists(&self, name: &str) -> Result<bool>;
    async fn list_namespaces(&self) -> Result<Vec<String>>;
    /// Create or replace a secret. Namespace and name come from its metadata.
    async fn upsert_secret(&self, secret: Secret) -> Result<()>;
    async fn list_sync_configs(&self) -> Result<Vec<HarborSync>>;
    /// `None` when the configuration no longer exists.
    async fn get_sync_config(&self, name: &str) -> Result<Option<HarborSync>>;
    async fn update_status(&self, name: &str, status: &HarborSyncStatus) -> Result<()>;
}

/// `ClusterApi` over a live kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn configs(&self) -> Api<HarborSync> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let found = api.get_opt(name).await.with_context(|| format!("fetching namespace {}", name))?;
        Ok(found.is_some())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.context("listing namespaces")?;
        Ok(list.items.iter().map(|ns| ns.name_any()).collect())
    }

    async fn upsert_secret(&self, secret: Secret) -> Result<()> {
        let ns = secret.metadata.namespace.clone().ok_or_else(|| anyhow!("secret without namespace"))?;
        let name = secret.metadata.name.clone().ok_or_else(|| anyhow!("secret without name"))?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &ns);
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &pp, &Patch::Apply(&secret))
            .await
            .with_context(|| format!("applying secret {}/{}", ns, name))?;
        Ok(())
    }

    async fn list_sync_configs(&self) -> Result<Vec<HarborSync>> {
        let list = self.configs().list(&ListParams::default()).await.context("listing sync configs")?;
        Ok(list.items)
    }

    async fn get_sync_config(&self, name: &str) -> Result<Option<HarborSync>> {
        self.configs().get_opt(name).await.with_context(|| format!("fetching sync config {}", name))
    }

    async fn update_status(&self, name: &str, status: &HarborSyncStatus) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.configs()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("writing status of sync config {}", name))?;
        Ok(())
    }
}

/// List+watch `HarborSync` objects and emit a work item per spec change.
/// Status-only updates keep the generation and are skipped, so the status
/// written at the end of a pass never re-triggers it.
pub async fn watch_sync_configs(client: Client, tx: mpsc::Sender<WorkItem>) -> Result<()> {
    let api: Api<HarborSync> = Api::all(client);
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    let mut seen: HashMap<String, Option<i64>> = HashMap::new();
    info!("sync config watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) => {
                if changed_generation(&mut seen, &o) && tx.send(WorkItem::new(o.name_any())).await.is_err() {
                    break;
                }
            }
            Event::Deleted(o) => {
                let name = o.name_any();
                seen.remove(&name);
                debug!(config = %name, "sync config deleted");
                if tx.send(WorkItem::new(name)).await.is_err() {
                    break;
                }
            }
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                for o in list.iter() {
                    if changed_generation(&mut seen, o) && tx.send(WorkItem::new(o.name_any())).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
    warn!("sync config watcher stream ended");
    Ok(())
}

fn changed_generation(seen: &mut HashMap<String, Option<i64>>, obj: &HarborSync) -> bool {
    let generation = obj.metadata.generation;
    match seen.insert(obj.name_any(), generation) {
        Some(prev) => prev != generation || generation.is_none(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsync_core::HarborSyncSpec;

    fn config(name: &str, generation: Option<i64>) -> HarborSync {
        let spec: HarborSyncSpec = serde_json::from_value(serde_json::json!({
            "name": "team-.*",
            "robotAccountSuffix": "sync",
        }))
        .unwrap();
        let mut hs = HarborSync::new(name, spec);
        hs.metadata.generation = generation;
        hs
    }

    #[test]
    fn generation_filter_skips_status_only_updates() {
        let mut seen = HashMap::new();
        assert!(changed_generation(&mut seen, &config("a", Some(1))));
        assert!(!changed_generation(&mut seen, &config("a", Some(1))));
        assert!(changed_generation(&mut seen, &config("a", Some(2))));
        assert!(changed_generation(&mut seen, &config("b", Some(2))));
    }
}

//! In-memory cluster for tests and local runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hsync_core::{HarborSync, HarborSyncStatus};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;

use crate::ClusterApi;

#[derive(Default)]
struct FakeState {
    namespaces: BTreeSet<String>,
    secrets: BTreeMap<(String, String), Secret>,
    configs: BTreeMap<String, HarborSync>,
    failing_namespaces: BTreeSet<String>,
    fail_list_namespaces: bool,
    fail_status: bool,
    status_writes: Vec<(String, HarborSyncStatus)>,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_namespace(&self, name: &str) {
        self.state().namespaces.insert(name.to_string());
    }

    pub fn put_config(&self, config: HarborSync) {
        self.state().configs.insert(config.name_any(), config);
    }

    pub fn remove_config(&self, name: &str) {
        self.state().configs.remove(name);
    }

    pub fn config(&self, name: &str) -> Option<HarborSync> {
        self.state().configs.get(name).cloned()
    }

    /// Secret upserts into `namespace` fail from now on.
    pub fn fail_secrets_in(&self, namespace: &str) {
        self.state().failing_namespaces.insert(namespace.to_string());
    }

    pub fn fail_list_namespaces(&self, on: bool) {
        self.state().fail_list_namespaces = on;
    }

    pub fn fail_status(&self, on: bool) {
        self.state().fail_status = on;
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state().secrets.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    /// (namespace, name) of every stored secret, in order.
    pub fn secret_keys(&self) -> Vec<(String, String)> {
        self.state().secrets.keys().cloned().collect()
    }

    pub fn status_writes(&self) -> Vec<(String, HarborSyncStatus)> {
        self.state().status_writes.clone()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state().namespaces.contains(name))
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let s = self.state();
        if s.fail_list_namespaces {
            return Err(anyhow!("listing namespaces: unavailable"));
        }
        Ok(s.namespaces.iter().cloned().collect())
    }

    async fn upsert_secret(&self, secret: Secret) -> Result<()> {
        let ns = secret.metadata.namespace.clone().ok_or_else(|| anyhow!("secret without namespace"))?;
        let name = secret.metadata.name.clone().ok_or_else(|| anyhow!("secret without name"))?;
        let mut s = self.state();
        if s.failing_namespaces.contains(&ns) {
            return Err(anyhow!("applying secret {}/{}: forbidden", ns, name));
        }
        if !s.namespaces.contains(&ns) {
            return Err(anyhow!("applying secret {}/{}: namespace not found", ns, name));
        }
        s.secrets.insert((ns, name), secret);
        Ok(())
    }

    async fn list_sync_configs(&self) -> Result<Vec<HarborSync>> {
        Ok(self.state().configs.values().cloned().collect())
    }

    async fn get_sync_config(&self, name: &str) -> Result<Option<HarborSync>> {
        Ok(self.state().configs.get(name).cloned())
    }

    async fn update_status(&self, name: &str, status: &HarborSyncStatus) -> Result<()> {
        let mut s = self.state();
        if s.fail_status {
            return Err(anyhow!("writing status of sync config {}: conflict", name));
        }
        let config = s.configs.get_mut(name).ok_or_else(|| anyhow!("sync config {} not found", name))?;
        config.status = Some(status.clone());
        s.status_writes.push((name.to_string(), status.clone()));
        Ok(())
    }
}

//! Credential store backed by cluster-scoped `HarborRobotAccount` records.

use std::collections::BTreeMap;

use async_trait::async_trait;
use hsync_core::{normalize_robot_name, HarborRobotAccount, HarborRobotAccountSpec, RobotAccountCredential};
use hsync_persist::{CredentialStore, StoreError, StoreResult};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

use crate::FIELD_MANAGER;

const MAX_NAME_LEN: usize = 63;

/// Record name for `(project, robot)`: `"{project}-{robot}-{hash}"` with every
/// run of characters outside `[a-zA-Z0-9-]` collapsed to a single `-`.
/// The hash keeps names that sanitise to the same text apart.
pub fn build_resource_name(project: &str, robot: &str) -> StoreResult<String> {
    let robot = normalize_robot_name(project, robot);
    let raw = format!("{}-{}-{}", project, robot, name_hash(project, &robot));
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    if out.len() > MAX_NAME_LEN {
        return Err(StoreError::ResourceNameTooLong { project: project.to_string(), robot, name: out });
    }
    Ok(out)
}

fn name_hash(project: &str, robot: &str) -> u64 {
    format!("{}|{}", project, robot)
        .chars()
        .enumerate()
        .map(|(i, c)| i as u64 * u64::from(c))
        .sum()
}

fn backend(op: &str, name: &str, e: kube::Error) -> StoreError {
    StoreError::Backend(format!("{} robot account record {}: {}", op, name, e))
}

pub struct CrdStore {
    api: Api<HarborRobotAccount>,
}

impl CrdStore {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }

    /// Every record's `(project, robot)` annotations with its credential.
    pub async fn entries(&self) -> StoreResult<Vec<(String, String, RobotAccountCredential)>> {
        let list = self.api.list(&ListParams::default()).await.map_err(|e| backend("listing", "*", e))?;
        let mut out: Vec<_> = list
            .items
            .into_iter()
            .map(|r| {
                let ann = r.metadata.annotations.unwrap_or_default();
                let project = ann.get("project").cloned().unwrap_or_default();
                let robot = ann.get("robot").cloned().unwrap_or_default();
                (project, robot, r.spec.credential)
            })
            .collect();
        out.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        Ok(out)
    }
}

#[async_trait]
impl CredentialStore for CrdStore {
    async fn has(&self, project: &str, name: &str) -> StoreResult<bool> {
        match self.get(project, name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get(&self, project: &str, name: &str) -> StoreResult<RobotAccountCredential> {
        let rname = build_resource_name(project, name)?;
        match self.api.get_opt(&rname).await.map_err(|e| backend("fetching", &rname, e))? {
            Some(record) => Ok(record.spec.credential),
            None => Err(StoreError::NotFound { project: project.to_string(), name: name.to_string() }),
        }
    }

    async fn set(&self, project: &str, credential: &RobotAccountCredential) -> StoreResult<()> {
        let rname = build_resource_name(project, &credential.name)?;
        let mut record = HarborRobotAccount::new(&rname, HarborRobotAccountSpec { credential: credential.clone() });
        record.metadata.annotations = Some(BTreeMap::from([
            ("project".to_string(), project.to_string()),
            ("robot".to_string(), credential.name.clone()),
        ]));
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        self.api.patch(&rname, &pp, &Patch::Apply(&record)).await.map_err(|e| backend("applying", &rname, e))?;

        let status = serde_json::json!({ "status": { "lastSync": chrono::Utc::now().timestamp() } });
        self.api
            .patch_status(&rname, &PatchParams::default(), &Patch::Merge(&status))
            .await
            .map_err(|e| backend("updating status of", &rname, e))?;
        debug!(project = %project, record = %rname, "stored credential record");
        Ok(())
    }

    async fn reset(&self) -> StoreResult<()> {
        self.api
            .delete_collection(&DeleteParams::default(), &ListParams::default())
            .await
            .map_err(|e| backend("deleting", "*", e))?;
        info!("deleted all robot account records");
        Ok(())
    }
}

//! Per-configuration reconcile pass and the serial work loop around it.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use hsync_core::status::{merge, PassObservation, Readiness};
use hsync_core::{HarborSync, HarborSyncStatus, MetricsSink, ProjectMatchingType, WorkItem};
use hsync_harbor::RegistryApi;
use hsync_kubehub::ClusterApi;
use hsync_persist::CredentialStore;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::mapping::apply_mapping;
use crate::matcher;
use crate::robot::reconcile_robot_account;
use crate::webhook::{WebhookDispatcher, WebhookPayload};
use crate::{ControllerConfig, SyncError, SyncResult};

/// Everything one pass observed. `status` is the merged status to persist.
#[derive(Debug, Default)]
pub struct PassReport {
    pub config: String,
    pub matched: Vec<String>,
    pub reconciled: Vec<String>,
    /// Projects whose credential was (re)issued in this pass.
    pub changed: Vec<String>,
    pub project_errors: Vec<(String, SyncError)>,
    pub mapping_errors: Vec<(String, SyncError)>,
    pub webhook_errors: Vec<(String, SyncError)>,
    /// Set when the pass stopped before visiting any project.
    pub aborted: Option<SyncError>,
    pub status: HarborSyncStatus,
}

impl PassReport {
    pub fn is_ready(&self) -> bool {
        self.aborted.is_none() && self.project_errors.is_empty()
    }
}

pub struct Reconciler {
    registry: Arc<dyn RegistryApi>,
    creds: Arc<dyn CredentialStore>,
    cluster: Option<Arc<dyn ClusterApi>>,
    webhooks: WebhookDispatcher,
    metrics: Arc<dyn MetricsSink>,
    config: ControllerConfig,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn RegistryApi>,
        creds: Arc<dyn CredentialStore>,
        cluster: Option<Arc<dyn ClusterApi>>,
        metrics: Arc<dyn MetricsSink>,
        config: ControllerConfig,
    ) -> SyncResult<Self> {
        let webhooks = WebhookDispatcher::new(Arc::clone(&metrics))?;
        Ok(Self { registry, creds, cluster, webhooks, metrics, config })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Run one pass over `config` without persisting anything but credentials
    /// and secrets. Without a cluster, mappings are skipped.
    pub async fn pass(&self, config: &HarborSync, now: DateTime<Utc>) -> PassReport {
        let name = config.name_any();
        let spec = &config.spec;
        let prev = config.status.clone().unwrap_or_default();
        let mut report = PassReport { config: name.clone(), ..Default::default() };

        let re = match spec.type_ {
            ProjectMatchingType::Regex => matcher::compile(&spec.project_name),
            ProjectMatchingType::Unsupported => Err(SyncError::UnsupportedSelector),
        };
        let selected = match re {
            Ok(re) => match self.registry.list_projects().await {
                Ok(all) => Ok((matcher::match_projects(&re, &all), re, all.len())),
                Err(e) => Err(SyncError::from(e)),
            },
            Err(e) => Err(e),
        };
        let (projects, re, total) = match selected {
            Ok(v) => v,
            Err(e) => {
                error!(config = %name, error = %e, "aborting reconcile pass");
                self.metrics.reconcile_error(&name, if e.is_config_fatal() { "config" } else { "registry" });
                let reason = if e.is_config_fatal() { "InvalidSelector" } else { "RegistryUnavailable" };
                let obs = PassObservation::new(Readiness::NotReady { reason: reason.into(), message: e.to_string() });
                report.status = merge(&prev, &obs, now);
                report.aborted = Some(e);
                return report;
            }
        };
        debug!(config = %name, matching_projects = projects.len(), all_projects = total, "found matching projects");
        self.metrics.matching_projects(&name, &spec.project_name, projects.len());
        report.matched = projects.iter().map(|p| p.name.clone()).collect();

        let mut obs = PassObservation::new(Readiness::Ready { message: String::new() });
        if self.cluster.is_none() && !spec.mapping.is_empty() {
            debug!(config = %name, "no cluster configured, skipping mappings");
        }
        let base_url = self.registry.base_url();

        for project in &projects {
            let reconciled = match reconcile_robot_account(
                self.registry.as_ref(),
                self.creds.as_ref(),
                project,
                &spec.robot_account_suffix,
                spec.push_access,
                self.config.rotation_horizon,
                now,
            )
            .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(config = %name, project = %project.name, error = %e, "error reconciling robot account");
                    self.metrics.reconcile_error(&name, "robot");
                    report.project_errors.push((project.name.clone(), e));
                    continue;
                }
            };
            obs.reconciled.push(project.name.clone());
            report.reconciled.push(project.name.clone());

            if reconciled.changed {
                report.changed.push(project.name.clone());
                if !spec.webhook.is_empty() {
                    info!(config = %name, project = %project.name, robot = %reconciled.credential.name, "robot account changed, sending webhooks");
                    let payload = WebhookPayload { project: project.name.clone(), credentials: reconciled.credential.clone() };
                    if let Err(e) = self.webhooks.dispatch(&name, &spec.webhook, &payload).await {
                        self.metrics.reconcile_error(&name, "webhook");
                        report.webhook_errors.push((project.name.clone(), e));
                    }
                }
            }

            let Some(cluster) = self.cluster.as_deref() else {
                continue;
            };
            for mapping in &spec.mapping {
                let outcome = apply_mapping(cluster, &re, mapping, project, &base_url, &reconciled.credential).await;
                for ns in outcome.namespaces {
                    obs.namespaces.push((project.name.clone(), ns));
                }
                for e in outcome.errors {
                    warn!(config = %name, project = %project.name, mapping = %mapping.type_, error = %e, "mapping failed");
                    self.metrics.reconcile_error(&name, "mapping");
                    report.mapping_errors.push((project.name.clone(), e));
                }
            }
        }

        obs.readiness = match report.project_errors.first() {
            None => Readiness::Ready { message: format!("{} of {} matching projects reconciled", report.reconciled.len(), projects.len()) },
            Some((project, e)) => Readiness::NotReady { reason: "ReconcileFailed".into(), message: format!("{}: {}", project, e) },
        };
        report.status = merge(&prev, &obs, now);
        report
    }

    /// Fetch the named configuration, run a pass and persist its status.
    /// `Ok(None)` when the configuration no longer exists. An aborted pass or a
    /// failed status write is returned as an error after the status was written.
    pub async fn reconcile(&self, item: &WorkItem) -> SyncResult<Option<PassReport>> {
        let cluster = self
            .cluster
            .as_deref()
            .ok_or_else(|| SyncError::Cluster(anyhow::anyhow!("no cluster configured for {}", item.name)))?;
        let Some(config) = cluster.get_sync_config(&item.name).await.map_err(SyncError::Cluster)? else {
            debug!(config = %item.name, "ignoring deleted sync config");
            return Ok(None);
        };

        let started = Instant::now();
        let mut report = self.pass(&config, Utc::now()).await;
        cluster.update_status(&item.name, &report.status).await.map_err(|e| {
            error!(config = %item.name, error = %e, "could not update sync config status");
            SyncError::Cluster(e)
        })?;
        info!(
            config = %item.name,
            matched = report.matched.len(),
            reconciled = report.reconciled.len(),
            changed = report.changed.len(),
            failed = report.project_errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reconcile pass finished"
        );
        match report.aborted.take() {
            Some(e) => Err(e),
            None => Ok(Some(report)),
        }
    }

    /// Process work items one at a time. A pass that returns an error is
    /// re-enqueued on `requeue` after `requeue_after`.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<WorkItem>, requeue: mpsc::Sender<WorkItem>) {
        while let Some(item) = rx.recv().await {
            if let Err(e) = self.reconcile(&item).await {
                warn!(config = %item.name, error = %e, after_secs = self.config.requeue_after.as_secs(), "requeueing sync config");
                let tx = requeue.clone();
                let delay = self.config.requeue_after;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(item).await;
                });
            }
        }
        debug!("work queue closed");
    }
}

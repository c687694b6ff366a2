//! harbor-sync reconcile engine.
//!
//! Project matching, the robot account state machine, namespace/secret
//! mapping, webhook fan-out, the per-configuration orchestrator and the
//! trigger fan-in that feeds it.

#![forbid(unsafe_code)]

use std::time::Duration;

use hsync_harbor::HarborError;
use hsync_persist::StoreError;
use thiserror::Error;

pub mod mapping;
pub mod matcher;
pub mod reconcile;
pub mod robot;
pub mod trigger;
pub mod webhook;

pub use reconcile::{PassReport, Reconciler};
pub use trigger::TriggerAdapter;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("unsupported project selector type; only Regex is supported")]
    UnsupportedSelector,
    #[error("registry: {0}")]
    Registry(#[from] HarborError),
    #[error("credential store: {0}")]
    Store(StoreError),
    #[error("cluster: {0:#}")]
    Cluster(anyhow::Error),
    #[error("webhook: {0}")]
    Webhook(String),
    #[error("unknown mapping type {0:?}")]
    UnknownMapping(String),
    #[error("resource name {name:?} for {project}/{robot} is too long")]
    ResourceNameTooLong { project: String, robot: String, name: String },
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ResourceNameTooLong { project, robot, name } => {
                SyncError::ResourceNameTooLong { project, robot, name }
            }
            other => SyncError::Store(other),
        }
    }
}

impl SyncError {
    /// Errors that no retry of the same configuration can fix.
    pub fn is_config_fatal(&self) -> bool {
        matches!(self, SyncError::InvalidPattern { .. } | SyncError::UnsupportedSelector)
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Engine timings. `rotation_horizon` is both the rotation cadence and the
/// expiry lookahead of a robot account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub rotation_horizon: Duration,
    pub poll_interval: Duration,
    pub force_sync_interval: Duration,
    pub requeue_after: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            rotation_horizon: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(300),
            force_sync_interval: Duration::from_secs(600),
            requeue_after: Duration::from_secs(15),
        }
    }
}

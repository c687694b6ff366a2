//! harbor-sync registry access: the `RegistryApi` capability set, the live HTTP
//! client and an in-memory fake.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use hsync_core::{CreatedRobot, Project, RobotAccount};

pub mod client;
pub mod fake;

pub use client::{ClientConfig, HarborClient, HarborVersion, SystemInfo};
pub use fake::FakeRegistry;

#[derive(Debug, thiserror::Error)]
pub enum HarborError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("http {method} {path}: {source}")]
    Transport {
        method: String,
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected response status {status} for {method} {path}")]
    Status { method: String, path: String, status: u16 },
    #[error("decoding response of {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported harbor version {0}")]
    Version(String),
    #[error("project {0} not found")]
    ProjectNotFound(String),
    #[error("robot account {robot} not found in project {project}")]
    RobotNotFound { project: String, robot: i64 },
}

pub type HarborResult<T> = Result<T, HarborError>;

/// Read/write capability set shared by the live client and the cache decorator.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    async fn list_projects(&self) -> HarborResult<Vec<Project>>;
    async fn get_robot_accounts(&self, project: &Project) -> HarborResult<Vec<RobotAccount>>;
    /// Create `robot$<suffix>` in `project`, pull-only unless `push_access`.
    async fn create_robot_account(&self, suffix: &str, push_access: bool, project: &Project) -> HarborResult<CreatedRobot>;
    async fn delete_robot_account(&self, project: &Project, robot_id: i64) -> HarborResult<()>;
    fn base_url(&self) -> String;
}

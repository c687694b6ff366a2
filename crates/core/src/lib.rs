//! harbor-sync core types: registry entities, credentials, custom resources.

#![forbid(unsafe_code)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod crd;
pub mod metrics;
pub mod status;

pub use crd::{
    ConditionStatus, HarborRobotAccount, HarborRobotAccountSpec, HarborRobotAccountStatus, HarborSync,
    HarborSyncSpec, HarborSyncStatus, MappingType, ProjectMapping, ProjectMatchingType, ProjectStatus,
    SyncCondition, WebhookConfig, READY_CONDITION,
};
pub use metrics::{MetricsSink, NoopSink, RecorderSink};

/// Every robot account name issued by Harbor starts with this marker.
pub const ROBOT_PREFIX: &str = "robot$";

/// A Harbor project. `name` is the matching identity, `id` addresses API calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Project {
    #[serde(rename = "project_id")]
    pub id: i64,
    pub name: String,
}

/// Robot account as listed by `GET /projects/{id}/robots`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RobotAccount {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
    /// RFC3339 creation time as reported by the registry (kept raw, may not parse).
    #[serde(default)]
    pub creation_time: String,
    /// Expiry as unix seconds.
    #[serde(default)]
    pub expires_at: i64,
}

/// Name/token pair returned by a successful robot creation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedRobot {
    pub name: String,
    pub token: String,
}

impl std::fmt::Debug for CreatedRobot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedRobot").field("name", &self.name).field("token", &"<redacted>").finish()
    }
}

/// The only artifact written to a credential store. Also part of the webhook payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RobotAccountCredential {
    pub name: String,
    /// Unix seconds.
    pub created_at: i64,
    pub token: String,
}

impl std::fmt::Debug for RobotAccountCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotAccountCredential")
            .field("name", &self.name)
            .field("created_at", &self.created_at)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// "Reconcile this configuration" unit of work, addressed by configuration name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub name: String,
}

impl WorkItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Name of the robot account managed for a given suffix.
pub fn managed_name(suffix: &str) -> String {
    format!("{}{}", ROBOT_PREFIX, suffix)
}

/// Harbor >= 2.2 names project robots `robot${project}+{suffix}`; map them back
/// to `robot${suffix}` so both API generations address the same account.
pub fn normalize_robot_name(project: &str, name: &str) -> String {
    let scoped = format!("{}{}+", ROBOT_PREFIX, project);
    match name.strip_prefix(&scoped) {
        Some(rest) => managed_name(rest),
        None => name.to_string(),
    }
}

/// True if `robot_name` is the account this system manages for `suffix` in `project`.
pub fn is_managed(project: &str, suffix: &str, robot_name: &str) -> bool {
    normalize_robot_name(project, robot_name) == managed_name(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_name_recognizes_both_generations() {
        assert!(is_managed("team-a", "sync", "robot$sync"));
        assert!(is_managed("team-a", "sync", "robot$team-a+sync"));
        assert!(!is_managed("team-a", "sync", "robot$team-b+sync"));
        assert!(!is_managed("team-a", "sync", "robot$other"));
        assert!(!is_managed("team-a", "sync", "sync"));
    }

    #[test]
    fn credential_debug_hides_token() {
        let c = RobotAccountCredential { name: "robot$x".into(), created_at: 1, token: "s3cr3t".into() };
        let s = format!("{:?}", c);
        assert!(!s.contains("s3cr3t"));
        assert!(s.contains("robot$x"));
    }

    #[test]
    fn credential_wire_shape() {
        let c = RobotAccountCredential { name: "robot$x".into(), created_at: 42, token: "t".into() };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v, serde_json::json!({"name": "robot$x", "created_at": 42, "token": "t"}));
    }
}

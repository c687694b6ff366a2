//! Custom resources: `HarborSync` (sync configuration) and `HarborRobotAccount`
//! (structured-record credential storage). Both are cluster scoped.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::RobotAccountCredential;

pub const GROUP: &str = "crd.harborsync.k8s.io";

/// Desired state: which projects to match and where their credentials go.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "crd.harborsync.k8s.io",
    version = "v1",
    kind = "HarborSync",
    status = "HarborSyncStatus",
    shortname = "hs",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HarborSyncSpec {
    /// How `name` is interpreted. Only `Regex` is supported.
    #[serde(rename = "type", default)]
    pub type_: ProjectMatchingType,
    /// Project match pattern. Capture groups are available to mappings.
    #[serde(rename = "name")]
    pub project_name: String,
    /// Grant push in addition to pull. Takes effect on the next rotation.
    #[serde(default)]
    pub push_access: bool,
    #[schemars(length(min = 4))]
    pub robot_account_suffix: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mapping: Vec<ProjectMapping>,
    /// Endpoints called whenever a project's credential changes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhook: Vec<WebhookConfig>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ProjectMatchingType {
    #[default]
    Regex,
    #[serde(other)]
    Unsupported,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct ProjectMapping {
    #[serde(rename = "type", default)]
    pub type_: MappingType,
    /// Template (Translate) or regular expression (Match).
    pub namespace: String,
    /// Secret name template; may reference project capture groups.
    pub secret: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum MappingType {
    /// One project to one namespace via capture-group substitution.
    #[default]
    Translate,
    /// `namespace` is a regex matched against every cluster namespace.
    Match,
    #[serde(other)]
    Unsupported,
}

impl std::fmt::Display for MappingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MappingType::Translate => "Translate",
            MappingType::Match => "Match",
            MappingType::Unsupported => "Unsupported",
        };
        f.write_str(s)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct WebhookConfig {
    pub endpoint: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HarborSyncStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_projects: Vec<ProjectStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SyncCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    pub name: String,
    /// RFC3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled_at: Option<String>,
    /// Only grows across passes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_namespaces: Vec<String>,
}

pub const READY_CONDITION: &str = "Ready";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// RFC3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// One record per (project, robot) pair holding the stored credential.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "crd.harborsync.k8s.io",
    version = "v1",
    kind = "HarborRobotAccount",
    status = "HarborRobotAccountStatus",
    shortname = "hra"
)]
pub struct HarborRobotAccountSpec {
    pub credential: RobotAccountCredential,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HarborRobotAccountStatus {
    /// Unix seconds of the last `set`.
    #[serde(default)]
    pub last_sync: i64,
}

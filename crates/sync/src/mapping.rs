//! Projects to namespaces: where the pull secret for a project credential goes.
//!
//! Both strategies substitute capture groups of the project pattern into the
//! rule templates (`$1`, `${name}`), with the replacement applied to every
//! match inside the project name.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hsync_core::{MappingType, Project, ProjectMapping, RobotAccountCredential};
use hsync_kubehub::ClusterApi;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::matcher::compile;
use crate::SyncError;

pub const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

pub fn translate(project_pattern: &Regex, project: &str, template: &str) -> String {
    project_pattern.replace_all(project, template).into_owned()
}

/// Registry auth document keyed by the registry base URL.
pub fn docker_config_json(base_url: &str, credential: &RobotAccountCredential) -> serde_json::Value {
    let auth = STANDARD.encode(format!("{}:{}", credential.name, credential.token));
    serde_json::json!({
        "auths": {
            base_url: {
                "username": credential.name,
                "password": credential.token,
                "auth": auth,
            }
        }
    })
}

pub fn make_secret(namespace: &str, name: &str, base_url: &str, credential: &RobotAccountCredential) -> Secret {
    let doc = docker_config_json(base_url, credential).to_string();
    Secret {
        metadata: ObjectMeta { namespace: Some(namespace.to_string()), name: Some(name.to_string()), ..Default::default() },
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        data: Some(BTreeMap::from([(DOCKER_CONFIG_JSON_KEY.to_string(), ByteString(doc.into_bytes()))])),
        ..Default::default()
    }
}

/// Result of one (project, rule) application. A failure for one namespace
/// never stops the others.
#[derive(Debug, Default)]
pub struct MappingOutcome {
    /// Namespaces that received the secret.
    pub namespaces: Vec<String>,
    pub errors: Vec<SyncError>,
}

pub async fn apply_mapping(
    cluster: &dyn ClusterApi,
    project_pattern: &Regex,
    mapping: &ProjectMapping,
    project: &Project,
    base_url: &str,
    credential: &RobotAccountCredential,
) -> MappingOutcome {
    let mut out = MappingOutcome::default();
    let secret_name = translate(project_pattern, &project.name, &mapping.secret);
    let targets = match mapping.type_ {
        MappingType::Translate => {
            let ns = translate(project_pattern, &project.name, &mapping.namespace);
            match cluster.namespace_exists(&ns).await {
                Ok(true) => vec![ns],
                Ok(false) => {
                    debug!(project = %project.name, namespace = %ns, "ignoring proposed namespace");
                    Vec::new()
                }
                Err(e) => {
                    out.errors.push(SyncError::Cluster(e));
                    return out;
                }
            }
        }
        MappingType::Match => {
            let ns_pattern = match compile(&mapping.namespace) {
                Ok(re) => re,
                Err(e) => {
                    out.errors.push(e);
                    return out;
                }
            };
            match cluster.list_namespaces().await {
                Ok(all) => all.into_iter().filter(|ns| ns_pattern.is_match(ns)).collect(),
                Err(e) => {
                    out.errors.push(SyncError::Cluster(e));
                    return out;
                }
            }
        }
        MappingType::Unsupported => {
            out.errors.push(SyncError::UnknownMapping(mapping.type_.to_string()));
            return out;
        }
    };

    for ns in targets {
        let secret = make_secret(&ns, &secret_name, base_url, credential);
        match cluster.upsert_secret(secret).await {
            Ok(()) => {
                info!(project = %project.name, namespace = %ns, secret = %secret_name, "upserted secret");
                out.namespaces.push(ns);
            }
            Err(e) => {
                warn!(project = %project.name, namespace = %ns, secret = %secret_name, error = %e, "could not upsert secret");
                out.errors.push(SyncError::Cluster(e));
            }
        }
    }
    out
}

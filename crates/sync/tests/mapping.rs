use hsync_core::{MappingType, Project, ProjectMapping, RobotAccountCredential};
use hsync_kubehub::FakeCluster;
use hsync_sync::mapping::{apply_mapping, docker_config_json, DOCKER_CONFIG_JSON_KEY};
use hsync_sync::matcher::compile;
use hsync_sync::SyncError;

const BASE: &str = "https://harbor.example.com/";

fn cred() -> RobotAccountCredential {
    RobotAccountCredential { name: "robot$sync".into(), created_at: 1, token: "tok".into() }
}

fn project(id: i64, name: &str) -> Project {
    Project { id, name: name.into() }
}

fn rule(type_: MappingType, namespace: &str, secret: &str) -> ProjectMapping {
    ProjectMapping { type_, namespace: namespace.into(), secret: secret.into() }
}

#[tokio::test]
async fn translate_writes_into_existing_namespace_only() {
    let cluster = FakeCluster::new();
    cluster.add_namespace("team-a");
    let re = compile("team-(.*)").unwrap();
    let m = rule(MappingType::Translate, "team-$1", "team-$1-pull-token");

    let out = apply_mapping(&cluster, &re, &m, &project(1, "team-a"), BASE, &cred()).await;
    assert!(out.errors.is_empty());
    assert_eq!(out.namespaces, vec!["team-a".to_string()]);

    let secret = cluster.secret("team-a", "team-a-pull-token").unwrap();
    let data = secret.data.unwrap();
    let doc: serde_json::Value = serde_json::from_slice(&data[DOCKER_CONFIG_JSON_KEY].0).unwrap();
    assert_eq!(doc, docker_config_json(BASE, &cred()));

    let out = apply_mapping(&cluster, &re, &m, &project(2, "team-b"), BASE, &cred()).await;
    assert!(out.errors.is_empty());
    assert!(out.namespaces.is_empty());
    assert_eq!(cluster.secret_keys().len(), 1);
}

#[tokio::test]
async fn match_fans_out_to_every_matching_namespace() {
    let cluster = FakeCluster::new();
    for ns in ["team-a", "team-b", "kube-system"] {
        cluster.add_namespace(ns);
    }
    let re = compile("team-(.*)").unwrap();
    let m = rule(MappingType::Match, "team-.*", "platform-pull-token");

    let out = apply_mapping(&cluster, &re, &m, &project(1, "team-a"), BASE, &cred()).await;
    assert!(out.errors.is_empty());
    assert_eq!(out.namespaces, vec!["team-a".to_string(), "team-b".to_string()]);
    assert_eq!(
        cluster.secret_keys(),
        vec![
            ("team-a".to_string(), "platform-pull-token".to_string()),
            ("team-b".to_string(), "platform-pull-token".to_string()),
        ]
    );
    assert!(cluster.secret("kube-system", "platform-pull-token").is_none());
}

#[tokio::test]
async fn one_failing_namespace_does_not_stop_the_rest() {
    let cluster = FakeCluster::new();
    for ns in ["team-a", "team-b", "team-c"] {
        cluster.add_namespace(ns);
    }
    cluster.fail_secrets_in("team-b");
    let re = compile("team-(.*)").unwrap();
    let m = rule(MappingType::Match, "^team-", "pull");

    let out = apply_mapping(&cluster, &re, &m, &project(1, "team-a"), BASE, &cred()).await;
    assert_eq!(out.namespaces, vec!["team-a".to_string(), "team-c".to_string()]);
    assert_eq!(out.errors.len(), 1);
    assert!(matches!(out.errors[0], SyncError::Cluster(_)));
}

#[tokio::test]
async fn rule_level_errors() {
    let cluster = FakeCluster::new();
    cluster.add_namespace("team-a");
    let re = compile("team-(.*)").unwrap();
    let p = project(1, "team-a");

    let out = apply_mapping(&cluster, &re, &rule(MappingType::Unsupported, "x", "y"), &p, BASE, &cred()).await;
    assert!(matches!(out.errors.as_slice(), [SyncError::UnknownMapping(_)]));

    let out = apply_mapping(&cluster, &re, &rule(MappingType::Match, "team-(", "y"), &p, BASE, &cred()).await;
    assert!(matches!(out.errors.as_slice(), [SyncError::InvalidPattern { .. }]));

    cluster.fail_list_namespaces(true);
    let out = apply_mapping(&cluster, &re, &rule(MappingType::Match, ".*", "y"), &p, BASE, &cred()).await;
    assert!(matches!(out.errors.as_slice(), [SyncError::Cluster(_)]));
    assert!(cluster.secret_keys().is_empty());
}

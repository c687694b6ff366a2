use hsync_core::RobotAccountCredential;
use hsync_persist::{CredentialStore, SqliteStore};

fn cred(name: &str, created_at: i64, token: &str) -> RobotAccountCredential {
    RobotAccountCredential { name: name.into(), created_at, token: token.into() }
}

#[tokio::test]
async fn set_get_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let s = SqliteStore::open(dir.path().join("creds.db")).unwrap();

    assert!(!s.has("team-a", "robot$sync").await.unwrap());
    s.set("team-a", &cred("robot$sync", 1, "t1")).await.unwrap();
    s.set("team-a", &cred("robot$sync", 2, "t2")).await.unwrap();
    s.set("team-b", &cred("robot$sync", 3, "t3")).await.unwrap();

    let got = s.get("team-a", "robot$sync").await.unwrap();
    assert_eq!(got, cred("robot$sync", 2, "t2"));
    assert_eq!(
        s.keys().unwrap(),
        vec![("team-a".to_string(), "robot$sync".to_string()), ("team-b".to_string(), "robot$sync".to_string())]
    );
}

#[tokio::test]
async fn missing_entry_is_not_found() {
    let s = SqliteStore::open_in_memory().unwrap();
    let err = s.get("team-a", "robot$sync").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn survives_reopen_until_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("creds.db");
    {
        let s = SqliteStore::open(&path).unwrap();
        s.set("team-a", &cred("robot$team-a+sync", 5, "tok")).await.unwrap();
    }
    let s = SqliteStore::open(&path).unwrap();
    assert!(s.has("team-a", "robot$sync").await.unwrap());
    assert_eq!(s.get("team-a", "robot$sync").await.unwrap().token, "tok");

    s.reset().await.unwrap();
    assert!(!s.has("team-a", "robot$sync").await.unwrap());
    assert!(s.keys().unwrap().is_empty());
}

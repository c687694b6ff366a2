//! harbor-sync credential persistence: the `CredentialStore` contract and a
//! local SQLite key-value backend. Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use hsync_core::{normalize_robot_name, RobotAccountCredential};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no credential stored for {project}/{name}")]
    NotFound { project: String, name: String },
    #[error("resource name {name:?} for {project}/{robot} exceeds 63 characters")]
    ResourceNameTooLong { project: String, robot: String, name: String },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("credential encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Credentials keyed by `(project, robot name)`. Robot names are normalised with
/// `normalize_robot_name`, so `robot$p+x` and `robot$x` address the same entry.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn has(&self, project: &str, name: &str) -> StoreResult<bool>;
    async fn get(&self, project: &str, name: &str) -> StoreResult<RobotAccountCredential>;
    /// Insert or overwrite the entry for `(project, credential.name)`.
    async fn set(&self, project: &str, credential: &RobotAccountCredential) -> StoreResult<()>;
    /// Remove every entry.
    async fn reset(&self) -> StoreResult<()>;
}

/// SQLite-backed store. Simple, synchronous. Calls are short and not latency sensitive.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| StoreError::Backend(format!("creating {}: {}", dir.display(), e)))?;
            }
        }
        let db = rusqlite::Connection::open(path)?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        debug!(path = %path.display(), "opened credential store");
        Self::init(db)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(db: rusqlite::Connection) -> StoreResult<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS credentials (
                project    TEXT NOT NULL,
                robot      TEXT NOT NULL,
                cred       TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (project, robot)
            )",
            [],
        )?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn db(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, project: &str, robot: &str) -> StoreResult<Option<RobotAccountCredential>> {
        let db = self.db();
        let mut stmt = db.prepare("SELECT cred FROM credentials WHERE project = ?1 AND robot = ?2")?;
        let mut rows = stmt.query((project, robot))?;
        let raw: Option<String> = match rows.next()? {
            Some(row) => Some(row.get(0)?),
            None => None,
        };
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    /// Every stored `(project, robot)` key with its credential, in key order.
    pub fn entries(&self) -> StoreResult<Vec<(String, String, RobotAccountCredential)>> {
        let db = self.db();
        let mut stmt = db.prepare("SELECT project, robot, cred FROM credentials ORDER BY project, robot")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let project: String = row.get(0)?;
            let robot: String = row.get(1)?;
            let raw: String = row.get(2)?;
            out.push((project, robot, serde_json::from_str(&raw)?));
        }
        Ok(out)
    }

    pub fn keys(&self) -> StoreResult<Vec<(String, String)>> {
        Ok(self.entries()?.into_iter().map(|(p, r, _)| (p, r)).collect())
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn has(&self, project: &str, name: &str) -> StoreResult<bool> {
        Ok(self.lookup(project, &normalize_robot_name(project, name))?.is_some())
    }

    async fn get(&self, project: &str, name: &str) -> StoreResult<RobotAccountCredential> {
        self.lookup(project, &normalize_robot_name(project, name))?
            .ok_or_else(|| StoreError::NotFound { project: project.to_string(), name: name.to_string() })
    }

    async fn set(&self, project: &str, credential: &RobotAccountCredential) -> StoreResult<()> {
        let robot = normalize_robot_name(project, &credential.name);
        let raw = serde_json::to_string(credential)?;
        self.db().execute(
            "INSERT INTO credentials(project, robot, cred, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(project, robot) DO UPDATE SET cred = excluded.cred, updated_at = excluded.updated_at",
            (project, &robot, &raw, chrono::Utc::now().timestamp()),
        )?;
        debug!(project = %project, robot = %robot, "stored credential");
        Ok(())
    }

    async fn reset(&self) -> StoreResult<()> {
        let removed = self.db().execute("DELETE FROM credentials", [])?;
        debug!(removed, "credential store reset");
        Ok(())
    }
}

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<(String, String), RobotAccountCredential>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<(String, String), RobotAccountCredential>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Drop a single entry, as an operator clearing it by hand would.
    pub fn remove(&self, project: &str, name: &str) {
        self.entries().remove(&(project.to_string(), normalize_robot_name(project, name)));
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn has(&self, project: &str, name: &str) -> StoreResult<bool> {
        Ok(self.entries().contains_key(&(project.to_string(), normalize_robot_name(project, name))))
    }

    async fn get(&self, project: &str, name: &str) -> StoreResult<RobotAccountCredential> {
        self.entries()
            .get(&(project.to_string(), normalize_robot_name(project, name)))
            .cloned()
            .ok_or_else(|| StoreError::NotFound { project: project.to_string(), name: name.to_string() })
    }

    async fn set(&self, project: &str, credential: &RobotAccountCredential) -> StoreResult<()> {
        let key = (project.to_string(), normalize_robot_name(project, &credential.name));
        self.entries().insert(key, credential.clone());
        Ok(())
    }

    async fn reset(&self) -> StoreResult<()> {
        self.entries().clear();
        Ok(())
    }
}

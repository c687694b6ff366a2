//! harbor-sync registry cache: polls Harbor, mirrors projects and robot accounts
//! in RAM and signals when the mirrored state changes.
//!
//! `RegistryCache` implements `RegistryApi`, so it can stand in for the live
//! client anywhere. Reads are served from memory; mutations go to the wrapped
//! client and then refresh the affected project before returning. A project
//! whose refresh failed is re-fetched on its next read.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hsync_core::{CreatedRobot, MetricsSink, Project, RobotAccount};
use hsync_harbor::{HarborResult, RegistryApi};
use rustc_hash::FxHasher;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Mirrored registry state. Written only by `update` and the mutation pass-throughs.
#[derive(Debug, Clone, Default)]
pub struct CacheState {
    pub projects: BTreeMap<String, Project>,
    pub robots: HashMap<String, Vec<RobotAccount>>,
    pub state_hash: u64,
    /// Projects whose robot list could not be re-fetched after a mutation.
    /// The next read of such a project goes to the registry.
    pub stale: BTreeSet<String>,
}

impl CacheState {
    fn rehash(&mut self) {
        self.state_hash = state_hash(&self.projects, &self.robots);
    }
}

fn fx<T: Hash + ?Sized>(v: &T) -> u64 {
    let mut h = FxHasher::default();
    v.hash(&mut h);
    h.finish()
}

/// Hash of a robot list, independent of the order the registry returned it in.
pub fn robots_hash(robots: &[RobotAccount]) -> u64 {
    let mut sorted: Vec<&RobotAccount> = robots.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.name.cmp(&b.name)));
    fx(&sorted)
}

/// `hash(projects) + Σ hash(p, robots[p])`. Projects hash in name order.
pub fn state_hash(projects: &BTreeMap<String, Project>, robots: &HashMap<String, Vec<RobotAccount>>) -> u64 {
    let projects_hash = fx(&projects.values().collect::<Vec<_>>());
    projects
        .keys()
        .map(|name| {
            let per_project = robots.get(name).map(|r| robots_hash(r)).unwrap_or_else(|| robots_hash(&[]));
            fx(&(name, per_project))
        })
        .fold(projects_hash, u64::wrapping_add)
}

pub struct RegistryCache {
    client: Arc<dyn RegistryApi>,
    state: RwLock<CacheState>,
    metrics: Arc<dyn MetricsSink>,
}

impl RegistryCache {
    pub fn new(client: Arc<dyn RegistryApi>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { client, state: RwLock::new(CacheState::default()), metrics }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state_hash(&self) -> u64 {
        self.read().state_hash
    }

    pub fn snapshot(&self) -> CacheState {
        self.read().clone()
    }

    /// Refresh every project and its robot accounts. The first fetch error aborts
    /// the pass; projects already visited keep their fresh entries, the hash is
    /// left as it was.
    pub async fn update(&self) -> HarborResult<()> {
        let started = Instant::now();
        let res = self.update_inner().await;
        self.metrics.cache_update(res.is_ok(), started.elapsed().as_secs_f64());
        res
    }

    async fn update_inner(&self) -> HarborResult<()> {
        let projects = self.client.list_projects().await.map_err(|e| {
            error!(error = %e, "error listing projects");
            e
        })?;
        debug!(project_count = projects.len(), "listed projects");

        for project in &projects {
            let robots = self.client.get_robot_accounts(project).await.map_err(|e| {
                error!(project = %project.name, error = %e, "error fetching robot accounts");
                e
            })?;
            debug!(project = %project.name, robot_count = robots.len(), "fetched robot accounts");
            let mut st = self.write();
            st.projects.insert(project.name.clone(), project.clone());
            st.robots.insert(project.name.clone(), robots);
            st.stale.remove(&project.name);
        }

        let mut st = self.write();
        // full listing succeeded: drop projects that no longer exist remotely
        st.projects.retain(|name, _| projects.iter().any(|p| &p.name == name));
        let CacheState { projects: kept, robots, stale, .. } = &mut *st;
        robots.retain(|name, _| kept.contains_key(name));
        stale.retain(|name| kept.contains_key(name));
        st.rehash();
        Ok(())
    }

    async fn refresh_project(&self, project: &Project) -> HarborResult<()> {
        let robots = self.client.get_robot_accounts(project).await?;
        let mut st = self.write();
        st.projects.insert(project.name.clone(), project.clone());
        st.robots.insert(project.name.clone(), robots);
        st.stale.remove(&project.name);
        st.rehash();
        Ok(())
    }

    pub fn is_stale(&self, project: &str) -> bool {
        self.read().stale.contains(project)
    }

    /// Poll every `interval`. Each pass whose hash differs from the previous one
    /// emits a notification. The channel holds a single pending notification:
    /// while it is occupied the poller waits for the consumer before polling on.
    pub fn spawn_polling(self: &Arc<Self>, interval: Duration) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel::<()>(1);
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let old = cache.state_hash();
                debug!("starting sync");
                if let Err(e) = cache.update().await {
                    error!(error = %e, "error running update");
                }
                if cache.state_hash() != old {
                    info!(hash = cache.state_hash(), "harbor state changed");
                    if tx.send(()).await.is_err() {
                        debug!("notification receiver dropped; stopping poller");
                        break;
                    }
                }
                debug!("end sync");
                tokio::time::sleep(interval).await;
            }
        });
        rx
    }
}

#[async_trait]
impl RegistryApi for RegistryCache {
    async fn list_projects(&self) -> HarborResult<Vec<Project>> {
        Ok(self.read().projects.values().cloned().collect())
    }

    async fn get_robot_accounts(&self, project: &Project) -> HarborResult<Vec<RobotAccount>> {
        if self.is_stale(&project.name) {
            self.refresh_project(project).await?;
        }
        Ok(self.read().robots.get(&project.name).cloned().unwrap_or_default())
    }

    /// A failed refresh after a successful create keeps the credential: the
    /// project is marked stale, so the new account is never read as absent.
    async fn create_robot_account(&self, suffix: &str, push_access: bool, project: &Project) -> HarborResult<CreatedRobot> {
        let created = self.client.create_robot_account(suffix, push_access, project).await?;
        if let Err(e) = self.refresh_project(project).await {
            warn!(project = %project.name, error = %e, "could not refresh robot accounts after create");
            self.write().stale.insert(project.name.clone());
        }
        Ok(created)
    }

    async fn delete_robot_account(&self, project: &Project, robot_id: i64) -> HarborResult<()> {
        self.client.delete_robot_account(project, robot_id).await?;
        if let Err(e) = self.refresh_project(project).await {
            warn!(project = %project.name, error = %e, "could not refresh robot accounts after delete");
            let mut st = self.write();
            if let Some(list) = st.robots.get_mut(&project.name) {
                list.retain(|r| r.id != robot_id);
            }
            st.stale.insert(project.name.clone());
            st.rehash();
        }
        Ok(())
    }

    fn base_url(&self) -> String {
        self.client.base_url()
    }
}

//! In-memory registry used by tests and local runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use hsync_core::{managed_name, normalize_robot_name, CreatedRobot, Project, RobotAccount};

use crate::{HarborError, HarborResult, RegistryApi};

#[derive(Debug, Default)]
struct FakeState {
    projects: Vec<Project>,
    robots: BTreeMap<i64, Vec<RobotAccount>>,
    next_robot_id: i64,
    fail_list: bool,
    fail_robots: bool,
    fail_create: bool,
    fail_delete: bool,
    list_calls: usize,
    robot_calls: usize,
    created: Vec<(String, String)>,
    deleted: Vec<(String, i64)>,
}

/// Registry fake. Created robots expire 30 days after creation. Creating a
/// robot whose name is already taken in the project fails with 409.
#[derive(Debug)]
pub struct FakeRegistry {
    base_url: String,
    state: Mutex<FakeState>,
}

impl Default for FakeRegistry {
    fn default() -> Self {
        Self::new("https://harbor.example.com/")
    }
}

impl FakeRegistry {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), state: Mutex::new(FakeState { next_robot_id: 1, ..Default::default() }) }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_project(&self, id: i64, name: &str) -> Project {
        let p = Project { id, name: name.to_string() };
        let mut s = self.state();
        s.projects.retain(|x| x.id != id);
        s.projects.push(p.clone());
        s.robots.entry(id).or_default();
        p
    }

    pub fn remove_project(&self, id: i64) {
        let mut s = self.state();
        s.projects.retain(|x| x.id != id);
        s.robots.remove(&id);
    }

    /// Insert or replace (by id) a robot in the given project.
    pub fn put_robot(&self, project_id: i64, robot: RobotAccount) {
        let mut s = self.state();
        s.next_robot_id = s.next_robot_id.max(robot.id + 1);
        let list = s.robots.entry(project_id).or_default();
        list.retain(|r| r.id != robot.id);
        list.push(robot);
    }

    pub fn robots(&self, project_id: i64) -> Vec<RobotAccount> {
        self.state().robots.get(&project_id).cloned().unwrap_or_default()
    }

    pub fn fail_list(&self, on: bool) {
        self.state().fail_list = on;
    }

    pub fn fail_robots(&self, on: bool) {
        self.state().fail_robots = on;
    }

    pub fn fail_create(&self, on: bool) {
        self.state().fail_create = on;
    }

    pub fn fail_delete(&self, on: bool) {
        self.state().fail_delete = on;
    }

    /// (project, robot name) for every successful create.
    pub fn created(&self) -> Vec<(String, String)> {
        self.state().created.clone()
    }

    /// (project, robot id) for every successful delete.
    pub fn deleted(&self) -> Vec<(String, i64)> {
        self.state().deleted.clone()
    }

    /// Number of remote `list_projects` + `get_robot_accounts` calls served.
    pub fn remote_calls(&self) -> usize {
        let s = self.state();
        s.list_calls + s.robot_calls
    }

    fn unavailable(what: &str) -> HarborError {
        HarborError::Status { method: "FAKE".into(), path: what.to_string(), status: 503 }
    }
}

#[async_trait]
impl RegistryApi for FakeRegistry {
    async fn list_projects(&self) -> HarborResult<Vec<Project>> {
        let mut s = self.state();
        s.list_calls += 1;
        if s.fail_list {
            return Err(Self::unavailable("projects"));
        }
        Ok(s.projects.clone())
    }

    async fn get_robot_accounts(&self, project: &Project) -> HarborResult<Vec<RobotAccount>> {
        let mut s = self.state();
        s.robot_calls += 1;
        if s.fail_robots {
            return Err(Self::unavailable("robots"));
        }
        Ok(s.robots.get(&project.id).cloned().unwrap_or_default())
    }

    async fn create_robot_account(&self, suffix: &str, _push_access: bool, project: &Project) -> HarborResult<CreatedRobot> {
        let mut s = self.state();
        if s.fail_create {
            return Err(Self::unavailable("create"));
        }
        if !s.projects.iter().any(|p| p.id == project.id) {
            return Err(HarborError::ProjectNotFound(project.name.clone()));
        }
        let name = managed_name(suffix);
        let taken = s
            .robots
            .get(&project.id)
            .is_some_and(|list| list.iter().any(|r| normalize_robot_name(&project.name, &r.name) == name));
        if taken {
            return Err(HarborError::Status {
                method: "POST".into(),
                path: format!("projects/{}/robots", project.id),
                status: 409,
            });
        }
        let id = s.next_robot_id;
        s.next_robot_id += 1;
        let now = Utc::now();
        let robot = RobotAccount {
            id,
            name: name.clone(),
            disabled: false,
            creation_time: now.to_rfc3339(),
            expires_at: (now + Duration::days(30)).timestamp(),
        };
        s.robots.entry(project.id).or_default().push(robot);
        s.created.push((project.name.clone(), name.clone()));
        Ok(CreatedRobot { name, token: format!("token-{}-{}", project.id, id) })
    }

    async fn delete_robot_account(&self, project: &Project, robot_id: i64) -> HarborResult<()> {
        let mut s = self.state();
        if s.fail_delete {
            return Err(Self::unavailable("delete"));
        }
        let list = s.robots.entry(project.id).or_default();
        let before = list.len();
        list.retain(|r| r.id != robot_id);
        if list.len() == before {
            return Err(HarborError::RobotNotFound { project: project.name.clone(), robot: robot_id });
        }
        s.deleted.push((project.name.clone(), robot_id));
        Ok(())
    }

    fn base_url(&self) -> String {
        self.base_url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_robot_names_conflict() {
        let fake = FakeRegistry::default();
        let p = fake.add_project(1, "team-a");
        fake.create_robot_account("sync", false, &p).await.unwrap();
        let err = fake.create_robot_account("sync", false, &p).await.unwrap_err();
        assert!(matches!(err, HarborError::Status { status: 409, .. }));
        assert_eq!(fake.created().len(), 1);

        // the 2.2 project-scoped spelling occupies the same name
        let q = fake.add_project(2, "team-b");
        fake.put_robot(2, RobotAccount { id: 50, name: "robot$team-b+sync".into(), ..fake.robots(1)[0].clone() });
        assert!(fake.create_robot_account("sync", false, &q).await.is_err());
        assert!(fake.create_robot_account("other", false, &q).await.is_ok());
    }
}

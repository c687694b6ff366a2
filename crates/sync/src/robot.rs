//! Robot account lifecycle for one project: keep, rotate or (re)create the
//! managed account and keep the credential store in step with it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hsync_core::{is_managed, managed_name, Project, RobotAccount, RobotAccountCredential};
use hsync_harbor::RegistryApi;
use hsync_persist::CredentialStore;
use tracing::{debug, info};

use crate::SyncResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateReason {
    MissingCredential,
    Disabled,
    Rotate,
    ExpiresSoon,
}

impl std::fmt::Display for RecreateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RecreateReason::MissingCredential => "store does not have credentials",
            RecreateReason::Disabled => "robot account is disabled",
            RecreateReason::Rotate => "robot account should rotate",
            RecreateReason::ExpiresSoon => "robot account expires soon",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Create,
    /// Delete `robot_id`, then create.
    Recreate { robot_id: i64, reason: RecreateReason },
    Keep,
}

fn horizon_secs(horizon: Duration) -> i64 {
    i64::try_from(horizon.as_secs()).unwrap_or(i64::MAX)
}

/// Created longer than `horizon` ago. An unparsable creation time counts as due.
pub fn should_rotate(robot: &RobotAccount, horizon: Duration, now: DateTime<Utc>) -> bool {
    match DateTime::parse_from_rfc3339(&robot.creation_time) {
        Ok(created) => created.timestamp().saturating_add(horizon_secs(horizon)) < now.timestamp(),
        Err(e) => {
            debug!(robot = %robot.name, creation_time = %robot.creation_time, error = %e, "unparsable creation time");
            true
        }
    }
}

/// Expires before `now + horizon`.
pub fn expires_soon(robot: &RobotAccount, horizon: Duration, now: DateTime<Utc>) -> bool {
    robot.expires_at < now.timestamp().saturating_add(horizon_secs(horizon))
}

/// First account in the list that is the managed one for `suffix`.
pub fn find_managed<'a>(robots: &'a [RobotAccount], project: &str, suffix: &str) -> Option<&'a RobotAccount> {
    robots.iter().find(|r| is_managed(project, suffix, &r.name))
}

/// Conditions are checked in order; the first one that holds wins.
pub fn decide(robot: Option<&RobotAccount>, has_credential: bool, horizon: Duration, now: DateTime<Utc>) -> Decision {
    let Some(robot) = robot else {
        return Decision::Create;
    };
    let reason = if !has_credential {
        RecreateReason::MissingCredential
    } else if robot.disabled {
        RecreateReason::Disabled
    } else if should_rotate(robot, horizon, now) {
        RecreateReason::Rotate
    } else if expires_soon(robot, horizon, now) {
        RecreateReason::ExpiresSoon
    } else {
        return Decision::Keep;
    };
    Decision::Recreate { robot_id: robot.id, reason }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub credential: RobotAccountCredential,
    pub changed: bool,
}

/// Bring the managed robot account of `project` to a healthy state.
///
/// A failed delete is returned without attempting a create. A failed store
/// write after a successful create is returned as well; the next pass sees no
/// stored credential and recreates the account.
pub async fn reconcile_robot_account(
    registry: &dyn RegistryApi,
    creds: &dyn CredentialStore,
    project: &Project,
    suffix: &str,
    push_access: bool,
    horizon: Duration,
    now: DateTime<Utc>,
) -> SyncResult<Reconciled> {
    let robots = registry.get_robot_accounts(project).await?;
    let name = managed_name(suffix);
    let managed = find_managed(&robots, &project.name, suffix);
    let has_credential = match managed {
        Some(_) => creds.has(&project.name, &name).await?,
        None => false,
    };

    match decide(managed, has_credential, horizon, now) {
        Decision::Keep => {
            debug!(project = %project.name, robot = %name, "found credentials in store, keeping robot account");
            let credential = creds.get(&project.name, &name).await?;
            return Ok(Reconciled { credential, changed: false });
        }
        Decision::Recreate { robot_id, reason } => {
            info!(project = %project.name, robot = %name, %reason, "deleting robot account");
            registry.delete_robot_account(project, robot_id).await?;
        }
        Decision::Create => {}
    }

    info!(project = %project.name, robot = %name, "creating robot account");
    let created = registry.create_robot_account(suffix, push_access, project).await?;
    let credential = RobotAccountCredential { name: created.name, created_at: now.timestamp(), token: created.token };
    creds.set(&project.name, &credential).await?;
    Ok(Reconciled { credential, changed: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const HOUR: Duration = Duration::from_secs(3600);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn healthy() -> RobotAccount {
        RobotAccount {
            id: 7,
            name: "robot$sync".into(),
            disabled: false,
            creation_time: "2024-06-01T11:30:00Z".into(),
            expires_at: now().timestamp() + 30 * 24 * 3600,
        }
    }

    #[test]
    fn healthy_account_is_kept() {
        assert_eq!(decide(Some(&healthy()), true, HOUR, now()), Decision::Keep);
    }

    #[test]
    fn absent_account_is_created() {
        assert_eq!(decide(None, false, HOUR, now()), Decision::Create);
        assert_eq!(decide(None, true, HOUR, now()), Decision::Create);
    }

    #[test]
    fn each_trigger_alone_forces_recreate() {
        let recreate = |r: RobotAccount, has: bool| match decide(Some(&r), has, HOUR, now()) {
            Decision::Recreate { robot_id, reason } => {
                assert_eq!(robot_id, 7);
                Some(reason)
            }
            _ => None,
        };

        assert_eq!(recreate(healthy(), false), Some(RecreateReason::MissingCredential));
        assert_eq!(recreate(RobotAccount { disabled: true, ..healthy() }, true), Some(RecreateReason::Disabled));
        assert_eq!(
            recreate(RobotAccount { creation_time: "not a time".into(), ..healthy() }, true),
            Some(RecreateReason::Rotate)
        );
        assert_eq!(
            recreate(RobotAccount { creation_time: "2024-06-01T10:59:59Z".into(), ..healthy() }, true),
            Some(RecreateReason::Rotate)
        );
        assert_eq!(
            recreate(RobotAccount { expires_at: now().timestamp() + 1800, ..healthy() }, true),
            Some(RecreateReason::ExpiresSoon)
        );
    }

    #[test]
    fn fractional_creation_times_parse() {
        let r = RobotAccount { creation_time: "2024-06-01T11:30:00.123456Z".into(), ..healthy() };
        assert!(!should_rotate(&r, HOUR, now()));
    }

    #[test]
    fn only_the_managed_name_is_considered() {
        let foreign = RobotAccount { id: 1, name: "robot$someone-else".into(), disabled: true, ..healthy() };
        let scoped = RobotAccount { id: 2, name: "robot$team-a+sync".into(), ..healthy() };
        let robots = vec![foreign.clone()];
        assert!(find_managed(&robots, "team-a", "sync").is_none());
        let robots = vec![foreign, scoped];
        assert_eq!(find_managed(&robots, "team-a", "sync").map(|r| r.id), Some(2));
    }
}

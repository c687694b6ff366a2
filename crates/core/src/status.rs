//! Status bookkeeping for `HarborSync`. Pure merges of a previous status and the
//! observations of one reconcile pass; nothing here talks to a cluster.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::crd::{ConditionStatus, HarborSyncStatus, ProjectStatus, SyncCondition, READY_CONDITION};

/// Outcome of a pass as reflected in the ready condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready { message: String },
    NotReady { reason: String, message: String },
}

/// What a single pass observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassObservation {
    /// Projects whose robot account reconciled successfully.
    pub reconciled: Vec<String>,
    /// (project, namespace) pairs that received a secret.
    pub namespaces: Vec<(String, String)>,
    pub readiness: Readiness,
}

impl PassObservation {
    pub fn new(readiness: Readiness) -> Self {
        Self { reconciled: Vec::new(), namespaces: Vec::new(), readiness }
    }
}

pub fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn project_entry<'a>(status: &'a mut HarborSyncStatus, project: &str) -> &'a mut ProjectStatus {
    let idx = match status.managed_projects.iter().position(|p| p.name == project) {
        Some(idx) => idx,
        None => {
            status.managed_projects.push(ProjectStatus { name: project.to_string(), ..Default::default() });
            status.managed_projects.len() - 1
        }
    };
    &mut status.managed_projects[idx]
}

/// Record a successful reconcile of `project` at `at`, creating the entry if absent.
pub fn touch_project(status: &mut HarborSyncStatus, project: &str, at: DateTime<Utc>) {
    project_entry(status, project).last_reconciled_at = Some(rfc3339(at));
}

/// Append `namespace` to the project's managed namespaces unless already present.
pub fn add_managed_namespace(status: &mut HarborSyncStatus, project: &str, namespace: &str) {
    let entry = project_entry(status, project);
    if !entry.managed_namespaces.iter().any(|n| n == namespace) {
        entry.managed_namespaces.push(namespace.to_string());
    }
}

/// Replace the ready condition. The transition time only moves when the status flips.
pub fn set_readiness(status: &mut HarborSyncStatus, readiness: &Readiness, now: DateTime<Utc>) {
    let (value, reason, message) = match readiness {
        Readiness::Ready { message } => (ConditionStatus::True, "Reconciled".to_string(), message.clone()),
        Readiness::NotReady { reason, message } => (ConditionStatus::False, reason.clone(), message.clone()),
    };
    let previous = status.conditions.iter().find(|c| c.type_ == READY_CONDITION);
    let last_transition_time = match previous {
        Some(c) if c.status == value => c.last_transition_time.clone().or_else(|| Some(rfc3339(now))),
        _ => Some(rfc3339(now)),
    };
    status.conditions.retain(|c| c.type_ != READY_CONDITION);
    status.conditions.push(SyncCondition {
        type_: READY_CONDITION.to_string(),
        status: value,
        reason,
        message,
        last_transition_time,
    });
}

/// Previous status + one pass worth of observations. Project entries and managed
/// namespaces accumulate, the ready condition is replaced.
pub fn merge(prev: &HarborSyncStatus, obs: &PassObservation, now: DateTime<Utc>) -> HarborSyncStatus {
    let mut next = prev.clone();
    for project in &obs.reconciled {
        touch_project(&mut next, project, now);
    }
    for (project, namespace) in &obs.namespaces {
        add_managed_namespace(&mut next, project, namespace);
    }
    set_readiness(&mut next, &obs.readiness, now);
    next
}

pub fn ready_condition(status: &HarborSyncStatus) -> Option<&SyncCondition> {
    status.conditions.iter().find(|c| c.type_ == READY_CONDITION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn ready() -> Readiness {
        Readiness::Ready { message: "ok".into() }
    }

    #[test]
    fn managed_namespaces_only_grow() {
        let mut obs = PassObservation::new(ready());
        obs.reconciled.push("team-a".into());
        obs.namespaces.push(("team-a".into(), "ns-1".into()));
        let first = merge(&HarborSyncStatus::default(), &obs, at(10));

        let mut obs2 = PassObservation::new(ready());
        obs2.namespaces.push(("team-a".into(), "ns-2".into()));
        obs2.namespaces.push(("team-a".into(), "ns-1".into()));
        let second = merge(&first, &obs2, at(20));

        let p = &second.managed_projects[0];
        assert_eq!(p.managed_namespaces, vec!["ns-1".to_string(), "ns-2".to_string()]);
        // not reconciled in the second pass: timestamp kept
        assert_eq!(p.last_reconciled_at.as_deref(), Some("1970-01-01T00:00:10Z"));

        // a pass that observed nothing keeps everything
        let third = merge(&second, &PassObservation::new(ready()), at(30));
        assert_eq!(third.managed_projects, second.managed_projects);
    }

    #[test]
    fn transition_time_moves_only_on_flip() {
        let s1 = merge(&HarborSyncStatus::default(), &PassObservation::new(ready()), at(1));
        let s2 = merge(&s1, &PassObservation::new(ready()), at(2));
        assert_eq!(ready_condition(&s2).unwrap().last_transition_time, ready_condition(&s1).unwrap().last_transition_time);

        let bad = Readiness::NotReady { reason: "ReconcileError".into(), message: "boom".into() };
        let s3 = merge(&s2, &PassObservation::new(bad), at(3));
        let c = ready_condition(&s3).unwrap();
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(c.message, "boom");
        assert_eq!(c.last_transition_time.as_deref(), Some("1970-01-01T00:00:03Z"));
        assert_eq!(s3.conditions.len(), 1);
    }
}

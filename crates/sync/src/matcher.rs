//! Project selection by regular expression.

use hsync_core::Project;
use regex::Regex;

use crate::{SyncError, SyncResult};

pub fn compile(pattern: &str) -> SyncResult<Regex> {
    Regex::new(pattern).map_err(|source| SyncError::InvalidPattern { pattern: pattern.to_string(), source })
}

/// Projects whose name contains a match of `re`, in input order.
pub fn match_projects(re: &Regex, projects: &[Project]) -> Vec<Project> {
    projects.iter().filter(|p| re.is_match(&p.name)).cloned().collect()
}

/// Compile `pattern` and select. An invalid pattern yields no partial result.
pub fn select(pattern: &str, projects: &[Project]) -> SyncResult<Vec<Project>> {
    Ok(match_projects(&compile(pattern)?, projects))
}

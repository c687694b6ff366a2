//! Live Harbor client. Each call issues HTTP requests; nothing is cached here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use hsync_core::{CreatedRobot, MetricsSink, Project, RobotAccount};
use reqwest::header::{ACCEPT, LINK, USER_AGENT};
use reqwest::{Method, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::{HarborError, HarborResult, RegistryApi};

const PAGE_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Prefix for relative API paths, e.g. `/api/` or `/api/v2.0/`.
    pub api_path: String,
    pub username: String,
    pub password: String,
    pub skip_tls_verify: bool,
    pub user_agent: String,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_path: "/api/".to_string(),
            username: username.into(),
            password: password.into(),
            skip_tls_verify: false,
            user_agent: "harbor-sync".to_string(),
        }
    }
}

/// Subset of `GET /systeminfo` we care about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub harbor_version: String,
    #[serde(default)]
    pub registry_url: String,
    #[serde(default)]
    pub external_url: String,
}

/// `major.minor.patch`; pre-release and build suffixes are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HarborVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl HarborVersion {
    /// First release with robot accounts.
    pub const MIN_SUPPORTED: HarborVersion = HarborVersion::new(1, 8, 0);
    /// Project-id resource paths are sufficient from here on.
    pub const ID_RESOURCES: HarborVersion = HarborVersion::new(1, 10, 0);
    /// Create response carries `secret` instead of `token`.
    pub const SECRET_RESPONSE: HarborVersion = HarborVersion::new(2, 2, 0);

    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let core = raw.trim().trim_start_matches('v');
        let core = core.split(['-', '+']).next().unwrap_or_default();
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        Some(Self { major, minor, patch })
    }
}

impl std::fmt::Display for HarborVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Serialize)]
struct CreateRobotRequest<'a> {
    name: &'a str,
    access: Vec<RobotAccess>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct RobotAccess {
    resource: String,
    action: &'static str,
}

#[derive(Deserialize)]
struct CreateRobotResponseV22 {
    name: String,
    secret: String,
}

pub struct HarborClient {
    base: Url,
    api_path: String,
    username: String,
    password: String,
    user_agent: String,
    http: reqwest::Client,
    metrics: Arc<dyn MetricsSink>,
    // robot names seen per project on the previous listing, to retire expiry series
    last_robots: Mutex<HashMap<String, Vec<String>>>,
}

impl HarborClient {
    pub fn new(cfg: ClientConfig, metrics: Arc<dyn MetricsSink>) -> HarborResult<Self> {
        if cfg.base_url.is_empty() {
            return Err(HarborError::Config("API base url can not be empty".into()));
        }
        if cfg.username.is_empty() || cfg.password.is_empty() {
            return Err(HarborError::Config("username and password must be set".into()));
        }
        let base = Url::parse(&cfg.base_url).map_err(|e| HarborError::Config(format!("invalid base url {}: {}", cfg.base_url, e)))?;
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(cfg.skip_tls_verify)
            .build()
            .map_err(|e| HarborError::Config(format!("building http client: {}", e)))?;
        let mut api_path = cfg.api_path;
        if !api_path.ends_with('/') {
            api_path.push('/');
        }
        Ok(Self {
            base,
            api_path,
            username: cfg.username,
            password: cfg.password,
            user_agent: cfg.user_agent,
            http,
            metrics,
            last_robots: Mutex::new(HashMap::new()),
        })
    }

    /// Relative paths get the API prefix; absolute paths (pagination links) are used as-is.
    fn resolve(&self, path: &str) -> HarborResult<Url> {
        let full = if path.starts_with('/') || path.contains("://") {
            path.to_string()
        } else {
            format!("{}{}", self.api_path, path)
        };
        self.base.join(&full).map_err(|e| HarborError::Config(format!("invalid path {}: {}", full, e)))
    }

    async fn send<B: Serialize + ?Sized>(&self, method: Method, path: &str, body: Option<&B>) -> HarborResult<reqwest::Response> {
        let url = self.resolve(path)?;
        let mut req = self
            .http
            .request(method.clone(), url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, &self.user_agent);
        if let Some(b) = body {
            req = req.json(b);
        }
        debug!(method = %method, url = %url, "issuing request");
        let started = Instant::now();
        let res = req.send().await;
        let code = res.as_ref().map(|r| r.status().as_u16()).unwrap_or(0);
        self.metrics.http_request(method.as_str(), url.path(), code, started.elapsed().as_secs_f64());
        let resp = res.map_err(|source| HarborError::Transport { method: method.to_string(), path: url.path().to_string(), source })?;
        if !resp.status().is_success() {
            return Err(HarborError::Status { method: method.to_string(), path: url.path().to_string(), status: resp.status().as_u16() });
        }
        Ok(resp)
    }

    async fn decode<T: DeserializeOwned>(path: &str, resp: reqwest::Response) -> HarborResult<T> {
        let bytes = resp
            .bytes()
            .await
            .map_err(|source| HarborError::Transport { method: "GET".into(), path: path.to_string(), source })?;
        serde_json::from_slice(&bytes).map_err(|source| HarborError::Decode { path: path.to_string(), source })
    }

    pub async fn system_info(&self) -> HarborResult<SystemInfo> {
        let resp = self.send::<()>(Method::GET, "systeminfo", None).await?;
        Self::decode("systeminfo", resp).await
    }

    pub async fn version(&self) -> HarborResult<HarborVersion> {
        let info = self.system_info().await?;
        HarborVersion::parse(&info.harbor_version).ok_or(HarborError::Version(info.harbor_version))
    }

    /// Fails unless the registry supports robot accounts.
    pub async fn check_version(&self) -> HarborResult<HarborVersion> {
        let v = self.version().await?;
        if v < HarborVersion::MIN_SUPPORTED {
            return Err(HarborError::Version(format!("{} (robot accounts need >= {})", v, HarborVersion::MIN_SUPPORTED)));
        }
        Ok(v)
    }

    fn observe_robots(&self, project: &Project, robots: &[RobotAccount]) {
        for r in robots {
            self.metrics.robot_expiry(&project.name, &r.name, r.expires_at);
        }
        let names: Vec<String> = robots.iter().map(|r| r.name.clone()).collect();
        let mut last = self.last_robots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = last.get(&project.name) {
            for gone in prev.iter().filter(|n| !names.contains(n)) {
                self.metrics.robot_expiry_removed(&project.name, gone);
            }
        }
        last.insert(project.name.clone(), names);
    }
}

fn access_for(version: HarborVersion, push_access: bool, project: &Project) -> Vec<RobotAccess> {
    let mut actions = vec!["pull"];
    if push_access {
        actions.push("push");
    }
    let mut access = Vec::new();
    for action in actions {
        access.push(RobotAccess { resource: format!("/project/{}/repository", project.id), action });
        if version < HarborVersion::ID_RESOURCES {
            access.push(RobotAccess { resource: format!("/project/{}/repository", project.name), action });
        }
    }
    access
}

/// Target of the `rel="next"` entry of a `Link` header.
pub(crate) fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|entry| {
        let mut segments = entry.split(';');
        let target = segments.next()?.trim();
        let url = target.strip_prefix('<')?.strip_suffix('>')?;
        let is_next = segments.any(|p| matches!(p.trim(), "rel=\"next\"" | "rel=next"));
        is_next.then(|| url.to_string())
    })
}

#[async_trait]
impl RegistryApi for HarborClient {
    async fn list_projects(&self) -> HarborResult<Vec<Project>> {
        let mut all = Vec::new();
        let mut next = Some(format!("projects?page=1&page_size={}", PAGE_SIZE));
        while let Some(path) = next.take() {
            let resp = self.send::<()>(Method::GET, &path, None).await?;
            next = resp.headers().get(LINK).and_then(|h| h.to_str().ok()).and_then(next_link);
            let page: Vec<Project> = Self::decode(&path, resp).await?;
            all.extend(page);
        }
        debug!(count = all.len(), "listed projects");
        Ok(all)
    }

    async fn get_robot_accounts(&self, project: &Project) -> HarborResult<Vec<RobotAccount>> {
        let path = format!("projects/{}/robots", project.id);
        let resp = self.send::<()>(Method::GET, &path, None).await?;
        let robots: Vec<RobotAccount> = Self::decode(&path, resp).await?;
        self.observe_robots(project, &robots);
        Ok(robots)
    }

    async fn create_robot_account(&self, suffix: &str, push_access: bool, project: &Project) -> HarborResult<CreatedRobot> {
        let version = self.version().await?;
        let body = CreateRobotRequest { name: suffix, access: access_for(version, push_access, project) };
        let path = format!("projects/{}/robots", project.id);
        let resp = self.send(Method::POST, &path, Some(&body)).await?;
        if resp.status() != StatusCode::CREATED {
            return Err(HarborError::Status { method: "POST".into(), path, status: resp.status().as_u16() });
        }
        if version >= HarborVersion::SECRET_RESPONSE {
            let r: CreateRobotResponseV22 = Self::decode(&path, resp).await?;
            return Ok(CreatedRobot { name: r.name, token: r.secret });
        }
        Self::decode(&path, resp).await
    }

    async fn delete_robot_account(&self, project: &Project, robot_id: i64) -> HarborResult<()> {
        let path = format!("projects/{}/robots/{}", project.id, robot_id);
        self.send::<()>(Method::DELETE, &path, None).await?;
        Ok(())
    }

    fn base_url(&self) -> String {
        self.base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing() {
        assert_eq!(HarborVersion::parse("v1.10.0-6a8a9c2"), Some(HarborVersion::new(1, 10, 0)));
        assert_eq!(HarborVersion::parse("2.2"), Some(HarborVersion::new(2, 2, 0)));
        assert_eq!(HarborVersion::parse("v2.3.1+build"), Some(HarborVersion::new(2, 3, 1)));
        assert_eq!(HarborVersion::parse("dev"), None);
        assert!(HarborVersion::new(1, 9, 9) < HarborVersion::ID_RESOURCES);
    }

    #[test]
    fn next_link_extraction() {
        let h = r#"</api/projects?page=1&page_size=10>; rel="prev" , </api/projects?page=3&page_size=10>; rel="next""#;
        assert_eq!(next_link(h).as_deref(), Some("/api/projects?page=3&page_size=10"));
        assert_eq!(next_link(r#"</api/projects?page=1>; rel="prev""#), None);
        assert_eq!(next_link(""), None);
    }

    #[test]
    fn legacy_versions_get_name_based_resources() {
        let p = Project { id: 7, name: "team-a".into() };
        let old = access_for(HarborVersion::new(1, 9, 0), true, &p);
        assert_eq!(old.len(), 4);
        assert!(old.contains(&RobotAccess { resource: "/project/team-a/repository".into(), action: "push" }));

        let new = access_for(HarborVersion::new(2, 0, 0), false, &p);
        assert_eq!(new, vec![RobotAccess { resource: "/project/7/repository".into(), action: "pull" }]);
    }
}

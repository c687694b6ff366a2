//! Metrics sink passed into components at construction.

use metrics::{counter, gauge, histogram};

/// Observation points used by the client, cache and reconcile engine.
pub trait MetricsSink: Send + Sync {
    fn http_request(&self, method: &str, path: &str, code: u16, seconds: f64);
    fn robot_expiry(&self, project: &str, robot: &str, expires_at: i64);
    fn robot_expiry_removed(&self, project: &str, robot: &str);
    fn matching_projects(&self, config: &str, pattern: &str, count: usize);
    /// `status` is the HTTP code as text, or `"error"` for transport failures.
    fn webhook_sent(&self, config: &str, target: &str, status: &str);
    fn reconcile_error(&self, config: &str, stage: &str);
    fn cache_update(&self, ok: bool, seconds: f64);
}

/// Discards everything. Default for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn http_request(&self, _: &str, _: &str, _: u16, _: f64) {}
    fn robot_expiry(&self, _: &str, _: &str, _: i64) {}
    fn robot_expiry_removed(&self, _: &str, _: &str) {}
    fn matching_projects(&self, _: &str, _: &str, _: usize) {}
    fn webhook_sent(&self, _: &str, _: &str, _: &str) {}
    fn reconcile_error(&self, _: &str, _: &str) {}
    fn cache_update(&self, _: bool, _: f64) {}
}

/// Forwards to the `metrics` facade; the binary installs the Prometheus exporter.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderSink;

impl MetricsSink for RecorderSink {
    fn http_request(&self, method: &str, path: &str, code: u16, seconds: f64) {
        histogram!(
            "http_request_duration_seconds",
            seconds,
            "code" => code.to_string(),
            "method" => method.to_string(),
            "path" => path.to_string()
        );
    }

    fn robot_expiry(&self, project: &str, robot: &str, expires_at: i64) {
        gauge!(
            "harbor_robot_account_expiry",
            expires_at as f64,
            "project" => project.to_string(),
            "robot" => robot.to_string()
        );
    }

    fn robot_expiry_removed(&self, project: &str, robot: &str) {
        // The facade has no series removal; zero marks a robot that no longer exists.
        gauge!(
            "harbor_robot_account_expiry",
            0.0,
            "project" => project.to_string(),
            "robot" => robot.to_string()
        );
    }

    fn matching_projects(&self, config: &str, pattern: &str, count: usize) {
        gauge!(
            "harbor_matching_projects",
            count as f64,
            "config" => config.to_string(),
            "selector_type" => "Regex",
            "selector_project_name" => pattern.to_string()
        );
    }

    fn webhook_sent(&self, config: &str, target: &str, status: &str) {
        counter!(
            "harbor_sync_sent_webhooks",
            1,
            "config" => config.to_string(),
            "target" => target.to_string(),
            "status_code" => status.to_string()
        );
    }

    fn reconcile_error(&self, config: &str, stage: &str) {
        counter!(
            "harbor_sync_reconcile_errors_total",
            1,
            "config" => config.to_string(),
            "stage" => stage.to_string()
        );
    }

    fn cache_update(&self, ok: bool, seconds: f64) {
        let result = if ok { "ok" } else { "error" };
        counter!("harbor_sync_cache_updates_total", 1, "result" => result);
        histogram!("harbor_sync_cache_update_seconds", seconds);
    }
}

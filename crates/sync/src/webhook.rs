//! Credential change notifications.

use std::sync::Arc;

use hsync_core::{MetricsSink, RobotAccountCredential, WebhookConfig};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub project: String,
    pub credentials: RobotAccountCredential,
}

pub struct WebhookDispatcher {
    http: reqwest::Client,
    metrics: Arc<dyn MetricsSink>,
}

impl WebhookDispatcher {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent("harbor-sync")
            .build()
            .map_err(|e| SyncError::Webhook(format!("building http client: {}", e)))?;
        Ok(Self { http, metrics })
    }

    /// POST `payload` to every endpoint. All endpoints are attempted; failures
    /// (transport errors, status >= 300) are joined into one error.
    pub async fn dispatch(&self, config: &str, endpoints: &[WebhookConfig], payload: &WebhookPayload) -> SyncResult<()> {
        let mut failures = Vec::new();
        for wh in endpoints {
            match self.http.post(&wh.endpoint).json(payload).send().await {
                Ok(res) if res.status().as_u16() < 300 => {
                    self.metrics.webhook_sent(config, &wh.endpoint, res.status().as_str());
                    info!(config = %config, url = %wh.endpoint, "successfully sent webhook");
                }
                Ok(res) => {
                    self.metrics.webhook_sent(config, &wh.endpoint, res.status().as_str());
                    error!(config = %config, url = %wh.endpoint, status = res.status().as_u16(), "unexpected webhook response");
                    failures.push(format!("{}: unexpected http response code {}", wh.endpoint, res.status().as_u16()));
                }
                Err(e) => {
                    self.metrics.webhook_sent(config, &wh.endpoint, "error");
                    error!(config = %config, url = %wh.endpoint, error = %e, "error sending webhook");
                    failures.push(format!("{}: {}", wh.endpoint, e));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Webhook(failures.join(" | ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_wire_shape() {
        let p = WebhookPayload {
            project: "team-a".into(),
            credentials: RobotAccountCredential { name: "robot$sync".into(), created_at: 9, token: "t".into() },
        };
        assert_eq!(
            serde_json::to_value(&p).unwrap(),
            serde_json::json!({"project": "team-a", "credentials": {"name": "robot$sync", "created_at": 9, "token": "t"}})
        );
    }
}

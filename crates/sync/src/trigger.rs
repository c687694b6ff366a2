//! Wake signals in, one work item per known configuration out.

use std::sync::Arc;
use std::time::Duration;

use hsync_core::WorkItem;
use hsync_kubehub::ClusterApi;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

pub struct TriggerAdapter {
    cluster: Arc<dyn ClusterApi>,
    out: mpsc::Sender<WorkItem>,
}

impl TriggerAdapter {
    pub fn new(cluster: Arc<dyn ClusterApi>, out: mpsc::Sender<WorkItem>) -> Self {
        Self { cluster, out }
    }

    /// One forwarding task per `(label, source)`, a single loop that lists the
    /// configurations on every wake-up. Returns once all sources are closed or
    /// the output receiver is gone.
    pub async fn run(self, sources: Vec<(&'static str, mpsc::Receiver<()>)>) {
        let (wake_tx, mut wake_rx) = mpsc::channel::<&'static str>(1);
        for (label, mut rx) in sources {
            let tx = wake_tx.clone();
            tokio::spawn(async move {
                while rx.recv().await.is_some() {
                    if tx.send(label).await.is_err() {
                        break;
                    }
                }
                debug!(source = label, "trigger source closed");
            });
        }
        drop(wake_tx);

        while let Some(source) = wake_rx.recv().await {
            if !self.fan_out(source).await {
                return;
            }
        }
    }

    /// Emit a work item for every configuration. `false` once the output is closed.
    async fn fan_out(&self, source: &str) -> bool {
        let configs = match self.cluster.list_sync_configs().await {
            Ok(c) => c,
            Err(e) => {
                warn!(source, error = %e, "could not list sync configs");
                return true;
            }
        };
        debug!(source, count = configs.len(), "dispatching sync configs");
        for config in configs {
            if self.out.send(WorkItem::new(config.name_any())).await.is_err() {
                return false;
            }
        }
        true
    }
}

/// Signals every `interval`, starting one interval from now.
pub fn force_sync_ticker(interval: Duration) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    rx
}

use std::sync::Arc;
use std::time::Duration;

use hsync_core::{HarborSync, HarborSyncSpec, WorkItem};
use hsync_kubehub::{ClusterApi, FakeCluster};
use hsync_sync::trigger::force_sync_ticker;
use hsync_sync::TriggerAdapter;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn config(name: &str) -> HarborSync {
    let spec: HarborSyncSpec =
        serde_json::from_value(serde_json::json!({"name": ".*", "robotAccountSuffix": "sync"})).unwrap();
    HarborSync::new(name, spec)
}

async fn next(rx: &mut mpsc::Receiver<WorkItem>) -> String {
    timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap().name
}

#[tokio::test]
async fn each_wake_up_emits_every_config() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.put_config(config("a"));
    cluster.put_config(config("b"));

    let (out_tx, mut out_rx) = mpsc::channel(8);
    let (cache_tx, cache_rx) = mpsc::channel(1);
    let (force_tx, force_rx) = mpsc::channel(1);
    let adapter = TriggerAdapter::new(Arc::clone(&cluster) as Arc<dyn ClusterApi>, out_tx);
    let handle = tokio::spawn(adapter.run(vec![("cache", cache_rx), ("force", force_rx)]));

    cache_tx.send(()).await.unwrap();
    assert_eq!(next(&mut out_rx).await, "a");
    assert_eq!(next(&mut out_rx).await, "b");

    cluster.put_config(config("c"));
    force_tx.send(()).await.unwrap();
    let mut got = vec![next(&mut out_rx).await, next(&mut out_rx).await, next(&mut out_rx).await];
    got.sort();
    assert_eq!(got, vec!["a", "b", "c"]);

    drop(cache_tx);
    drop(force_tx);
    timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn ticker_fires_repeatedly() {
    let mut rx = force_sync_ticker(Duration::from_millis(10));
    for _ in 0..3 {
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    }
}

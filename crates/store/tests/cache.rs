use std::sync::Arc;
use std::time::Duration;

use hsync_core::{NoopSink, RobotAccount};
use hsync_harbor::{FakeRegistry, RegistryApi};
use hsync_store::RegistryCache;

fn robot(id: i64, name: &str, disabled: bool) -> RobotAccount {
    RobotAccount { id, name: name.into(), disabled, creation_time: "2020-01-01T00:00:00Z".into(), expires_at: 1_900_000_000 }
}

fn cache_over(fake: &Arc<FakeRegistry>) -> Arc<RegistryCache> {
    Arc::new(RegistryCache::new(Arc::clone(fake) as Arc<dyn RegistryApi>, Arc::new(NoopSink)))
}

#[tokio::test]
async fn reads_are_served_from_memory() {
    let fake = Arc::new(FakeRegistry::default());
    let a = fake.add_project(1, "team-a");
    fake.put_robot(1, robot(10, "robot$sync", false));
    let cache = cache_over(&fake);

    assert!(cache.list_projects().await.unwrap().is_empty());
    cache.update().await.unwrap();
    let calls = fake.remote_calls();

    let projects = cache.list_projects().await.unwrap();
    assert_eq!(projects, vec![a.clone()]);
    assert_eq!(cache.get_robot_accounts(&a).await.unwrap().len(), 1);
    assert_eq!(fake.remote_calls(), calls);
}

#[tokio::test]
async fn hash_ignores_order_but_not_content() {
    let one = Arc::new(FakeRegistry::default());
    one.add_project(1, "team-a");
    one.add_project(2, "team-b");
    one.put_robot(1, robot(10, "robot$sync", false));
    one.put_robot(1, robot(11, "robot$other", false));

    let two = Arc::new(FakeRegistry::default());
    two.add_project(2, "team-b");
    two.add_project(1, "team-a");
    two.put_robot(1, robot(11, "robot$other", false));
    two.put_robot(1, robot(10, "robot$sync", false));

    let c1 = cache_over(&one);
    let c2 = cache_over(&two);
    c1.update().await.unwrap();
    c2.update().await.unwrap();
    assert_ne!(c1.state_hash(), 0);
    assert_eq!(c1.state_hash(), c2.state_hash());

    // unchanged remote state: same hash on the next pass
    let before = c1.state_hash();
    c1.update().await.unwrap();
    assert_eq!(c1.state_hash(), before);

    // flipping a single disabled flag must change it
    one.put_robot(1, robot(10, "robot$sync", true));
    c1.update().await.unwrap();
    assert_ne!(c1.state_hash(), before);
}

#[tokio::test]
async fn mutations_refresh_before_returning() {
    let fake = Arc::new(FakeRegistry::default());
    let a = fake.add_project(1, "team-a");
    let cache = cache_over(&fake);
    cache.update().await.unwrap();
    let h0 = cache.state_hash();

    let created = cache.create_robot_account("sync", false, &a).await.unwrap();
    assert_eq!(created.name, "robot$sync");
    let robots = cache.get_robot_accounts(&a).await.unwrap();
    assert_eq!(robots.len(), 1);
    assert_ne!(cache.state_hash(), h0);

    cache.delete_robot_account(&a, robots[0].id).await.unwrap();
    assert!(cache.get_robot_accounts(&a).await.unwrap().is_empty());
    assert_eq!(cache.state_hash(), h0);
}

#[tokio::test]
async fn failed_update_returns_error_and_keeps_hash() {
    let fake = Arc::new(FakeRegistry::default());
    fake.add_project(1, "team-a");
    let cache = cache_over(&fake);
    cache.update().await.unwrap();
    let h = cache.state_hash();

    fake.add_project(2, "team-b");
    fake.fail_robots(true);
    assert!(cache.update().await.is_err());
    assert_eq!(cache.state_hash(), h);

    fake.fail_robots(false);
    fake.fail_list(true);
    assert!(cache.update().await.is_err());
    assert_eq!(cache.list_projects().await.unwrap().len(), 1);
}

#[tokio::test]
async fn removed_projects_leave_the_mirror() {
    let fake = Arc::new(FakeRegistry::default());
    fake.add_project(1, "team-a");
    fake.add_project(2, "team-b");
    let cache = cache_over(&fake);
    cache.update().await.unwrap();
    fake.remove_project(2);
    cache.update().await.unwrap();
    let names: Vec<_> = cache.list_projects().await.unwrap().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["team-a".to_string()]);
}

#[tokio::test]
async fn poller_notifies_only_on_change() {
    let fake = Arc::new(FakeRegistry::default());
    fake.add_project(1, "team-a");
    let cache = cache_over(&fake);
    let mut rx = cache.spawn_polling(Duration::from_millis(10));

    // first pass moves the hash away from the empty state
    tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());

    fake.add_project(2, "team-b");
    tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(cache.list_projects().await.unwrap().len(), 2);
}

#[tokio::test]
async fn hash_tells_projects_apart() {
    let one = Arc::new(FakeRegistry::default());
    one.add_project(1, "a");
    one.add_project(2, "b");
    one.put_robot(1, robot(10, "robot$sync", false));

    let two = Arc::new(FakeRegistry::default());
    two.add_project(1, "a");
    two.add_project(2, "b");
    two.put_robot(2, robot(10, "robot$sync", false));

    let c1 = cache_over(&one);
    let c2 = cache_over(&two);
    c1.update().await.unwrap();
    c2.update().await.unwrap();
    assert_ne!(c1.state_hash(), c2.state_hash());
}

#[tokio::test]
async fn failed_refresh_after_create_refetches_on_next_read() {
    let fake = Arc::new(FakeRegistry::default());
    let a = fake.add_project(1, "team-a");
    let cache = cache_over(&fake);
    cache.update().await.unwrap();
    let h0 = cache.state_hash();

    fake.fail_robots(true);
    let created = cache.create_robot_account("sync", false, &a).await.unwrap();
    assert_eq!(created.name, "robot$sync");
    assert!(cache.is_stale("team-a"));
    // the stale entry is never served as "no robots"
    assert!(cache.get_robot_accounts(&a).await.is_err());

    fake.fail_robots(false);
    let robots = cache.get_robot_accounts(&a).await.unwrap();
    assert_eq!(robots.len(), 1);
    assert!(!cache.is_stale("team-a"));
    assert_ne!(cache.state_hash(), h0);

    let calls = fake.remote_calls();
    cache.get_robot_accounts(&a).await.unwrap();
    assert_eq!(fake.remote_calls(), calls);
}

#[tokio::test]
async fn failed_refresh_after_delete_drops_the_robot_locally() {
    let fake = Arc::new(FakeRegistry::default());
    let a = fake.add_project(1, "team-a");
    let cache = cache_over(&fake);
    cache.update().await.unwrap();
    let h0 = cache.state_hash();
    cache.create_robot_account("sync", false, &a).await.unwrap();
    let id = cache.get_robot_accounts(&a).await.unwrap()[0].id;

    fake.fail_robots(true);
    cache.delete_robot_account(&a, id).await.unwrap();
    assert_eq!(cache.state_hash(), h0);
    assert!(cache.snapshot().robots["team-a"].is_empty());

    fake.fail_robots(false);
    assert!(cache.get_robot_accounts(&a).await.unwrap().is_empty());
}

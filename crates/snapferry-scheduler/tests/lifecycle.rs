//! Create, mark and prune passes against the in-memory driver.

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use snapferry_scheduler::{
    jobs::{
        create_snapshots, mark_prunable_snapshots, prune_filesystems, prune_snapshots,
    },
    EventKind, JobContext, JobError, JobEvent, RunnerConfig,
};
use snapferry_storage::{
    coordination::format_time, DatasetType, ListOptions, MemoryDriver, PropertyNames,
    StorageDriver,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn names() -> PropertyNames {
    PropertyNames::default()
}

fn context(driver: Arc<MemoryDriver>, config: RunnerConfig) -> JobContext {
    JobContext::new(driver, config, CancellationToken::new())
}

fn record(ctx: &JobContext, kind: EventKind) -> Arc<Mutex<Vec<JobEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    ctx.events.subscribe(kind, move |event| {
        let sink = sink.clone();
        async move { sink.lock().push(event) }
    });
    seen
}

async fn snapshot_at(driver: &MemoryDriver, fs: &str, snap: &str, created: DateTime<Utc>) {
    let ds = driver.create_snapshot(fs, snap, false).await.unwrap();
    driver
        .set_property(&ds.name, &names().snapshot_created, &format_time(created))
        .await
        .unwrap();
}

async fn snapshot_names(driver: &MemoryDriver, fs: &str) -> Vec<String> {
    driver
        .list_datasets(ListOptions::recursive(DatasetType::Snapshot, fs))
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.name)
        .collect()
}

async fn delete_at(driver: &MemoryDriver, name: &str) -> Option<String> {
    let key = names().delete_at;
    driver
        .get_dataset(name, &[key.clone()])
        .await
        .unwrap()
        .prop(&key)
        .map(str::to_string)
}

#[tokio::test]
async fn test_keep_one_marks_then_prunes_the_older_snapshot() {
    let driver = Arc::new(MemoryDriver::with_root("pool/fs").unwrap());
    snapshot_at(&driver, "pool/fs", "s1", now() - Duration::minutes(10)).await;
    snapshot_at(&driver, "pool/fs", "s2", now()).await;
    let config = RunnerConfig {
        default_retention_count: Some(1),
        delete_grace_secs: 60,
        ..RunnerConfig::default()
    };
    let ctx = context(driver.clone(), config);
    let deleted = record(&ctx, EventKind::DeletedSnapshot);

    let marked = mark_prunable_snapshots(&ctx, now()).await.unwrap();
    assert_eq!(marked, vec!["pool/fs@s1"]);
    assert_eq!(
        delete_at(&driver, "pool/fs@s1").await,
        Some(format_time(now() + Duration::seconds(60)))
    );
    assert_eq!(delete_at(&driver, "pool/fs@s2").await, None);

    assert!(prune_snapshots(&ctx, now()).await.unwrap().is_empty());
    assert_eq!(snapshot_names(&driver, "pool/fs").await.len(), 2);

    let later = now() + Duration::seconds(61);
    let pruned = prune_snapshots(&ctx, later).await.unwrap();
    assert_eq!(pruned, vec!["pool/fs@s1"]);
    assert_eq!(snapshot_names(&driver, "pool/fs").await, vec!["pool/fs@s2"]);
    assert_eq!(
        *deleted.lock(),
        vec![JobEvent::DeletedSnapshot {
            snapshot: "pool/fs@s1".to_string(),
            logical_name: "fs@s1".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_second_mark_keeps_the_first_deadline() {
    let driver = Arc::new(MemoryDriver::with_root("pool/fs").unwrap());
    snapshot_at(&driver, "pool/fs", "s1", now() - Duration::hours(3)).await;
    snapshot_at(&driver, "pool/fs", "s2", now()).await;
    let ctx = context(
        driver.clone(),
        RunnerConfig {
            default_retention_minutes: Some(60),
            ..RunnerConfig::default()
        },
    );

    mark_prunable_snapshots(&ctx, now()).await.unwrap();
    let first = delete_at(&driver, "pool/fs@s1").await.unwrap();
    let again = mark_prunable_snapshots(&ctx, now() + Duration::minutes(30))
        .await
        .unwrap();
    assert!(again.is_empty());
    assert_eq!(delete_at(&driver, "pool/fs@s1").await.unwrap(), first);
}

#[tokio::test]
async fn test_retention_properties_override_defaults() {
    let driver = Arc::new(MemoryDriver::with_root("pool/fs").unwrap());
    for (i, snap) in ["a", "b", "c"].iter().enumerate() {
        snapshot_at(&driver, "pool/fs", snap, now() - Duration::minutes(30 - i as i64)).await;
    }
    driver
        .set_property("pool/fs", &names().snapshot_retention_count, "2")
        .await
        .unwrap();
    let ctx = context(
        driver.clone(),
        RunnerConfig {
            default_retention_count: Some(1),
            ..RunnerConfig::default()
        },
    );
    let marked = mark_prunable_snapshots(&ctx, now()).await.unwrap();
    assert_eq!(marked, vec!["pool/fs@a"]);
}

#[tokio::test]
async fn test_unsent_snapshots_are_not_marked_when_replicating() {
    let driver = Arc::new(MemoryDriver::with_root("pool/fs").unwrap());
    snapshot_at(&driver, "pool/fs", "a", now() - Duration::minutes(20)).await;
    snapshot_at(&driver, "pool/fs", "b", now() - Duration::minutes(10)).await;
    snapshot_at(&driver, "pool/fs", "c", now()).await;
    let names = names();
    driver
        .set_property("pool/fs", &names.snapshot_send_to, "http://127.0.0.1:1")
        .await
        .unwrap();
    driver
        .set_property("pool/fs@b", &names.snapshot_sent_at, &format_time(now()))
        .await
        .unwrap();
    let ctx = context(
        driver.clone(),
        RunnerConfig {
            default_retention_count: Some(1),
            ..RunnerConfig::default()
        },
    );
    let marked = mark_prunable_snapshots(&ctx, now()).await.unwrap();
    assert_eq!(marked, vec!["pool/fs@b"]);
}

#[tokio::test]
async fn test_prune_skips_the_snapshot_being_sent() {
    let driver = Arc::new(MemoryDriver::with_root("pool/fs").unwrap());
    snapshot_at(&driver, "pool/fs", "a", now()).await;
    let names = names();
    let past = format_time(now() - Duration::minutes(1));
    driver.set_property("pool/fs@a", &names.delete_at, &past).await.unwrap();
    driver
        .set_property("pool/fs", &names.sending_snapshot, "a")
        .await
        .unwrap();
    let ctx = context(driver.clone(), RunnerConfig::default());

    assert!(prune_snapshots(&ctx, now()).await.unwrap().is_empty());
    driver
        .inherit_property("pool/fs", &names.sending_snapshot)
        .await
        .unwrap();
    assert_eq!(prune_snapshots(&ctx, now()).await.unwrap(), vec!["pool/fs@a"]);
}

#[tokio::test]
async fn test_prune_skips_locked_filesystems() {
    let driver = Arc::new(MemoryDriver::with_root("pool/fs").unwrap());
    snapshot_at(&driver, "pool/fs", "a", now()).await;
    let past = format_time(now() - Duration::minutes(1));
    driver
        .set_property("pool/fs@a", &names().delete_at, &past)
        .await
        .unwrap();
    let ctx = context(driver.clone(), RunnerConfig::default());

    let guard = ctx.locks.try_lock("pool/fs").unwrap();
    assert!(prune_snapshots(&ctx, now()).await.unwrap().is_empty());
    drop(guard);
    assert_eq!(prune_snapshots(&ctx, now()).await.unwrap(), vec!["pool/fs@a"]);
}

#[tokio::test]
async fn test_filesystem_prune_leaves_parents_and_future_deadlines() {
    let driver = Arc::new(MemoryDriver::with_root("pool/old").unwrap());
    driver.create_filesystem("pool/keep/child").unwrap();
    driver.create_filesystem("pool/future").unwrap();
    let key = names().delete_at;
    let past = format_time(now() - Duration::minutes(5));
    let future = format_time(now() + Duration::minutes(5));
    driver.set_property("pool/old", &key, &past).await.unwrap();
    driver.set_property("pool/keep", &key, &past).await.unwrap();
    driver.set_property("pool/future", &key, &future).await.unwrap();

    let ctx = context(driver.clone(), RunnerConfig::default());
    let deleted = record(&ctx, EventKind::DeletedFilesystem);
    let pruned = prune_filesystems(&ctx, now()).await.unwrap();
    assert_eq!(pruned, vec!["pool/old"]);
    assert!(driver.get_dataset("pool/old", &[]).await.is_err());
    assert!(driver.get_dataset("pool/keep", &[]).await.is_ok());
    assert!(driver.get_dataset("pool/future", &[]).await.is_ok());
    assert_eq!(
        *deleted.lock(),
        vec![JobEvent::DeletedFilesystem {
            filesystem: "pool/old".to_string(),
            logical_name: "old".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_filesystem_with_snapshots_is_not_destroyed() {
    let driver = Arc::new(MemoryDriver::with_root("pool/fs").unwrap());
    snapshot_at(&driver, "pool/fs", "a", now()).await;
    let past = format_time(now() - Duration::minutes(5));
    driver
        .set_property("pool/fs", &names().delete_at, &past)
        .await
        .unwrap();
    let ctx = context(driver.clone(), RunnerConfig::default());
    assert!(prune_filesystems(&ctx, now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_deadline_fails_the_pass() {
    let driver = Arc::new(MemoryDriver::with_root("pool/bad").unwrap());
    driver.create_filesystem("pool/old").unwrap();
    let key = names().delete_at;
    driver.set_property("pool/bad", &key, "tomorrow").await.unwrap();
    let past = format_time(now() - Duration::minutes(5));
    driver.set_property("pool/old", &key, &past).await.unwrap();

    let ctx = context(driver.clone(), RunnerConfig::default());
    let err = prune_filesystems(&ctx, now()).await.unwrap_err();
    match err {
        JobError::MalformedProperty(e) => {
            assert_eq!(e.dataset, "pool/bad");
            assert_eq!(e.value, "tomorrow");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_create_honours_the_interval() {
    let driver = Arc::new(MemoryDriver::with_root("pool/fs").unwrap());
    driver.create_filesystem("pool/manual").unwrap();
    driver
        .set_property("pool/fs", &names().snapshot_interval_minutes, "15")
        .await
        .unwrap();
    let ctx = context(driver.clone(), RunnerConfig::default());
    let created = record(&ctx, EventKind::SnapshotCreated);

    let first = create_snapshots(&ctx, now()).await.unwrap();
    let name = format!("pool/fs@backup_{}", now().timestamp());
    assert_eq!(first, vec![name.clone()]);
    assert!(snapshot_names(&driver, "pool/manual").await.is_empty());

    let early = create_snapshots(&ctx, now() + Duration::minutes(14)).await.unwrap();
    assert!(early.is_empty());
    let due = create_snapshots(&ctx, now() + Duration::minutes(15)).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(snapshot_names(&driver, "pool/fs").await.len(), 2);
    assert_eq!(created.lock().len(), 2);

    let stamp = driver
        .get_dataset(&name, &[names().snapshot_created])
        .await
        .unwrap();
    assert_eq!(
        stamp.prop(&names().snapshot_created),
        Some(format_time(now()).as_str())
    );
}

#[tokio::test]
async fn test_create_skips_a_busy_filesystem() {
    let driver = Arc::new(MemoryDriver::with_root("pool/fs").unwrap());
    let ctx = context(
        driver.clone(),
        RunnerConfig {
            default_snapshot_interval_minutes: Some(5),
            ..RunnerConfig::default()
        },
    );
    let _guard = ctx.locks.try_lock("pool/fs").unwrap();
    assert!(create_snapshots(&ctx, now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_pass_reports_cancellation() {
    let driver = Arc::new(MemoryDriver::with_root("pool/fs").unwrap());
    let cancel = CancellationToken::new();
    let ctx = JobContext::new(
        driver,
        RunnerConfig {
            default_snapshot_interval_minutes: Some(5),
            ..RunnerConfig::default()
        },
        cancel.clone(),
    );
    cancel.cancel();
    assert!(create_snapshots(&ctx, now()).await.unwrap_err().is_cancelled());
}

use chrono::{DateTime, Utc};
use snapferry_storage::{
    coordination::{format_time, parse_count_property, snapshot_created_at, snapshot_due},
    Dataset,
};
use tracing::{debug, info, warn};

use super::JobContext;
use crate::error::JobResult;
use crate::events::JobEvent;

/// Snapshots every managed filesystem whose interval has elapsed.
///
/// The interval comes from the filesystem's interval property, else from the
/// configured default; filesystems with neither are left alone, as are those
/// with an interval of zero.
pub async fn create_snapshots(ctx: &JobContext, now: DateTime<Utc>) -> JobResult<Vec<String>> {
    let mut created = Vec::new();
    let mut failure = None;
    for fs in ctx.managed_filesystems().await? {
        ctx.check_cancelled()?;
        match create_one(ctx, &fs, now).await {
            Ok(Some(name)) => created.push(name),
            Ok(None) => {}
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(dataset = %fs.name, error = %e, "snapshot creation failed");
                failure.get_or_insert(e);
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(created),
    }
}

async fn create_one(
    ctx: &JobContext,
    fs: &Dataset,
    now: DateTime<Utc>,
) -> JobResult<Option<String>> {
    let names = ctx.names();
    let interval = match parse_count_property(fs, &names.snapshot_interval_minutes)? {
        Some(minutes) => minutes,
        None => match ctx.config.default_snapshot_interval_minutes {
            Some(minutes) => minutes,
            None => return Ok(None),
        },
    };
    if interval == 0 {
        return Ok(None);
    }

    let Some(_guard) = ctx.locks.try_lock(&fs.name) else {
        debug!(dataset = %fs.name, "busy, skipping snapshot creation");
        return Ok(None);
    };

    let mut newest = None;
    for snap in ctx.snapshots_of(&fs.name).await? {
        newest = newest.max(snapshot_created_at(&snap, names)?);
    }
    if !snapshot_due(newest, interval, now) {
        return Ok(None);
    }

    let name = ctx.config.snapshot_name(now.timestamp());
    let snap = ctx.driver.create_snapshot(&fs.name, &name, false).await?;
    ctx.driver
        .set_property(&snap.name, &names.snapshot_created, &format_time(now))
        .await?;
    info!(snapshot = %snap.name, interval_minutes = interval, "snapshot created");
    ctx.events
        .emit(JobEvent::SnapshotCreated {
            snapshot: snap.name.clone(),
        })
        .await;
    Ok(Some(snap.name))
}

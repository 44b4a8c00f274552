use chrono::{DateTime, Utc};
use snapferry_storage::{
    coordination::{
        format_time, next_delete_at, parse_count_property, parse_time_property,
        prunable_snapshots, snapshot_created_at,
    },
    Dataset, RetentionPolicy, SnapshotState,
};
use tracing::{debug, info, warn};

use super::JobContext;
use crate::error::JobResult;
use crate::events::JobEvent;

/// Gives every snapshot the retention policy lets go a deletion deadline of
/// `now` plus the grace period.
///
/// A snapshot that already carries a deadline keeps it. When the filesystem
/// replicates, only snapshots that reached the remote are marked.
pub async fn mark_prunable_snapshots(
    ctx: &JobContext,
    now: DateTime<Utc>,
) -> JobResult<Vec<String>> {
    let mut marked = Vec::new();
    let mut failure = None;
    for fs in ctx.managed_filesystems().await? {
        ctx.check_cancelled()?;
        match mark_filesystem(ctx, &fs, now).await {
            Ok(mut done) => marked.append(&mut done),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(dataset = %fs.name, error = %e, "marking failed");
                failure.get_or_insert(e);
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(marked),
    }
}

fn retention_policy(ctx: &JobContext, fs: &Dataset) -> JobResult<RetentionPolicy> {
    let names = ctx.names();
    Ok(RetentionPolicy {
        keep_count: parse_count_property(fs, &names.snapshot_retention_count)?
            .or(ctx.config.default_retention_count),
        keep_minutes: parse_count_property(fs, &names.snapshot_retention_minutes)?
            .or(ctx.config.default_retention_minutes),
        require_sent: fs.prop(&names.snapshot_send_to).is_some(),
    })
}

async fn mark_filesystem(
    ctx: &JobContext,
    fs: &Dataset,
    now: DateTime<Utc>,
) -> JobResult<Vec<String>> {
    let names = ctx.names();
    let policy = retention_policy(ctx, fs)?;
    if policy.is_empty() {
        return Ok(Vec::new());
    }
    let Some(_guard) = ctx.locks.try_lock(&fs.name) else {
        debug!(dataset = %fs.name, "busy, skipping mark");
        return Ok(Vec::new());
    };

    let snapshots = ctx.snapshots_of(&fs.name).await?;
    let mut states = Vec::with_capacity(snapshots.len());
    for snap in &snapshots {
        let Some(created) = snapshot_created_at(snap, names)? else {
            continue;
        };
        states.push(SnapshotState {
            name: snap.name.clone(),
            created,
            sent: snap.prop(&names.snapshot_sent_at).is_some(),
        });
    }

    let sending = fs.prop(&names.sending_snapshot);
    let proposed = now + ctx.config.delete_grace();
    let mut marked = Vec::new();
    for name in prunable_snapshots(&states, &policy, now) {
        let Some(snap) = snapshots.iter().find(|s| s.name == name) else {
            continue;
        };
        if sending.is_some() && snap.snapshot_name() == sending {
            continue;
        }
        let existing = parse_time_property(snap, &names.delete_at)?;
        let Some(delete_at) = next_delete_at(existing, proposed) else {
            continue;
        };
        let value = format_time(delete_at);
        ctx.driver.set_property(&name, &names.delete_at, &value).await?;
        info!(snapshot = %name, delete_at = %value, "snapshot marked for deletion");
        ctx.events
            .emit(JobEvent::SnapshotMarked {
                snapshot: name.clone(),
                delete_at: value,
            })
            .await;
        marked.push(name);
    }
    Ok(marked)
}

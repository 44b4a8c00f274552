use chrono::{DateTime, Utc};
use snapferry_storage::{
    coordination::{is_due, parse_time_property},
    DatasetType, DestroyFlags,
};
use tracing::{debug, info, warn};

use super::JobContext;
use crate::error::{JobError, JobResult};
use crate::events::JobEvent;

/// Destroys the snapshots whose deletion deadline has passed.
///
/// Snapshots with dependents and the snapshot a transfer is reading from are
/// left for a later round. A deadline that does not parse fails the pass.
pub async fn prune_snapshots(ctx: &JobContext, now: DateTime<Utc>) -> JobResult<Vec<String>> {
    prune(ctx, DatasetType::Snapshot, now).await
}

/// Destroys the filesystems whose deletion deadline has passed.
///
/// A filesystem with any descendant, snapshots included, is left alone: no
/// recursive destroy is ever issued.
pub async fn prune_filesystems(ctx: &JobContext, now: DateTime<Utc>) -> JobResult<Vec<String>> {
    prune(ctx, DatasetType::Filesystem, now).await
}

async fn prune(
    ctx: &JobContext,
    dataset_type: DatasetType,
    now: DateTime<Utc>,
) -> JobResult<Vec<String>> {
    let mut marked: Vec<String> = ctx
        .driver
        .list_with_property(
            dataset_type,
            &ctx.config.parent_dataset,
            &ctx.names().delete_at,
        )
        .await?
        .into_keys()
        .collect();
    marked.sort();

    let mut destroyed = Vec::new();
    let mut failure = None;
    for name in marked {
        ctx.check_cancelled()?;
        match prune_one(ctx, &name, dataset_type, now).await {
            Ok(true) => destroyed.push(name),
            Ok(false) => {}
            Err(e @ (JobError::Cancelled | JobError::MalformedProperty(_))) => return Err(e),
            Err(JobError::Driver(e)) if e.is_not_found() => {
                debug!(dataset = %name, "already gone");
            }
            Err(e) => {
                warn!(dataset = %name, error = %e, "prune failed");
                failure.get_or_insert(e);
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(destroyed),
    }
}

async fn prune_one(
    ctx: &JobContext,
    name: &str,
    expected: DatasetType,
    now: DateTime<Utc>,
) -> JobResult<bool> {
    let names = ctx.names();
    let ds = ctx
        .driver
        .get_dataset(name, &[names.delete_at.clone()])
        .await?;
    if ds.dataset_type != expected {
        return Err(JobError::UnexpectedType {
            dataset: name.to_string(),
            expected,
            actual: ds.dataset_type,
        });
    }
    let Some(delete_at) = parse_time_property(&ds, &names.delete_at)? else {
        return Ok(false);
    };
    if !is_due(delete_at, now) {
        return Ok(false);
    }

    let filesystem = ds.filesystem_name();
    let Some(_guard) = ctx.locks.try_lock(filesystem) else {
        debug!(dataset = name, "busy, skipping prune");
        return Ok(false);
    };

    if let Some(snap) = ds.snapshot_name() {
        let fs = ctx
            .driver
            .get_dataset(filesystem, &[names.sending_snapshot.clone()])
            .await?;
        if fs.prop(&names.sending_snapshot) == Some(snap) {
            info!(dataset = name, "snapshot is being sent, not destroying");
            return Ok(false);
        }
    }

    let children = ctx.driver.children(name, 0).await?;
    if !children.is_empty() {
        info!(dataset = name, children = children.len(), "has children, not destroying");
        return Ok(false);
    }

    ctx.driver
        .destroy_dataset(name, DestroyFlags::default())
        .await?;
    let logical_name = ctx.logical_name(name).to_string();
    info!(dataset = name, %delete_at, "destroyed");
    let event = match expected {
        DatasetType::Snapshot => JobEvent::DeletedSnapshot {
            snapshot: name.to_string(),
            logical_name,
        },
        _ => JobEvent::DeletedFilesystem {
            filesystem: name.to_string(),
            logical_name,
        },
    };
    ctx.events.emit(event).await;
    Ok(true)
}

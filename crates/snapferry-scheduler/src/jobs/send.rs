use chrono::{DateTime, Utc};
use snapferry_storage::{coordination::format_time, dataset::snapshot_full_name, SendOptions};
use snapferry_transport::{PushSource, ReceiveRequest, TransportClient};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::JobContext;
use crate::error::JobResult;
use crate::events::JobEvent;

/// One send worker pass: replicates every filesystem that names a remote.
///
/// Several workers run this concurrently; the dataset lock gives each
/// filesystem to exactly one of them per round.
pub async fn send_snapshots(
    ctx: &JobContext,
    worker: usize,
    now: DateTime<Utc>,
) -> JobResult<Vec<String>> {
    let names = ctx.names();
    let mut sent = Vec::new();
    let mut failure = None;
    for fs in ctx.managed_filesystems().await? {
        ctx.check_cancelled()?;
        let Some(url) = fs.prop(&names.snapshot_send_to) else {
            continue;
        };
        let Some(_guard) = ctx.locks.try_lock(&fs.name) else {
            debug!(worker, dataset = %fs.name, "busy, skipping send");
            continue;
        };
        match send_filesystem(ctx, &fs.name, url, now).await {
            Ok(mut done) => sent.append(&mut done),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(worker, dataset = %fs.name, remote = url, error = %e, "send failed");
                failure.get_or_insert(e);
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(sent),
    }
}

async fn send_filesystem(
    ctx: &JobContext,
    filesystem: &str,
    url: &str,
    now: DateTime<Utc>,
) -> JobResult<Vec<String>> {
    let names = ctx.names();
    let client = TransportClient::new(url, ctx.config.send_auth_token.clone())?
        .with_throttle(ctx.send_throttle())
        .with_push_timeout(ctx.config.send_timeout());
    let remote_fs = ctx.logical_name(filesystem).to_string();
    let mut sent = Vec::new();

    if let Some(token) = ctx.remote(client.resume_token(&remote_fs)).await? {
        info!(dataset = filesystem, remote = url, "resuming interrupted transfer");
        let target = ReceiveRequest {
            filesystem: remote_fs.clone(),
            resumable: ctx.config.send_resumable,
            resume_token: Some(token.clone()),
            ..Default::default()
        };
        let received = client
            .push(ctx.driver.clone(), PushSource::Resume { token }, &target)
            .await?;
        if let Some(snap) = received.snapshot_name() {
            let local = snapshot_full_name(filesystem, snap);
            ctx.driver
                .set_property(&local, &names.snapshot_sent_at, &format_time(now))
                .await?;
            sent.push(local);
        }
    }

    let local = ctx.snapshots_of(filesystem).await?;
    if local.is_empty() {
        return Ok(sent);
    }
    let on_remote: HashSet<String> = ctx
        .remote(client.list_snapshots(&remote_fs, &[]))
        .await?
        .unwrap_or_default()
        .iter()
        .filter_map(|ds| ds.snapshot_name().map(str::to_string))
        .collect();

    let newest_common = local.iter().rposition(|snap| {
        snap.snapshot_name()
            .map(|n| on_remote.contains(n))
            .unwrap_or(false)
    });
    let start = match newest_common {
        Some(idx) => idx + 1,
        None if on_remote.is_empty() => 0,
        None => {
            warn!(
                dataset = filesystem,
                remote = url,
                "remote holds snapshots but none in common, cannot send incrementally"
            );
            return Ok(sent);
        }
    };

    let mut base = newest_common.map(|idx| local[idx].name.clone());
    for snap in &local[start..] {
        ctx.check_cancelled()?;
        let target = ReceiveRequest {
            filesystem: remote_fs.clone(),
            snapshot: snap.snapshot_name().map(str::to_string),
            resumable: ctx.config.send_resumable,
            ..Default::default()
        };
        let source = PushSource::Snapshot {
            name: snap.name.clone(),
            opts: SendOptions {
                raw: ctx.config.send_raw,
                include_properties: ctx.config.send_include_properties,
                incremental_base: base.clone(),
            },
        };

        ctx.events
            .emit(JobEvent::TransferStarted {
                snapshot: snap.name.clone(),
            })
            .await;
        let result = client.push(ctx.driver.clone(), source, &target).await;
        ctx.events
            .emit(JobEvent::TransferCompleted {
                snapshot: snap.name.clone(),
                succeeded: result.is_ok(),
            })
            .await;
        result?;

        ctx.driver
            .set_property(&snap.name, &names.snapshot_sent_at, &format_time(now))
            .await?;
        info!(
            snapshot = %snap.name,
            remote = url,
            incremental = base.is_some(),
            "snapshot sent"
        );
        sent.push(snap.name.clone());
        base = Some(snap.name.clone());
    }
    Ok(sent)
}

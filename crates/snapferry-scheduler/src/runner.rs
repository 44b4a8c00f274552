//! The periodic loops.
//!
//! One tokio task per enabled job, plus one per send worker. Each loop waits
//! on its own jittered ticker or the shared cancellation token, runs a single
//! pass, logs the outcome and waits again. Passes of one loop never overlap.

use chrono::Utc;
use snapferry_storage::StorageDriver;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::RunnerConfig;
use crate::error::JobResult;
use crate::events::EventBus;
use crate::jitter;
use crate::jobs::{self, JobContext};

/// Owner of the lifecycle loops.
pub struct Runner {
    ctx: Arc<JobContext>,
    tasks: JoinSet<()>,
}

impl Runner {
    /// Creates a runner; nothing runs until [`Runner::start`].
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        config: RunnerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx: Arc::new(JobContext::new(driver, config, cancel)),
            tasks: JoinSet::new(),
        }
    }

    /// Shared job state.
    pub fn context(&self) -> &Arc<JobContext> {
        &self.ctx
    }

    /// Event bus, for subscribing extra listeners before `start`.
    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    /// Number of running loops.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Spawns the enabled loops.
    pub fn start(&mut self) {
        let config = self.ctx.config.clone();
        if config.enable_snapshot_create {
            self.spawn_loop(
                "create-snapshots",
                secs(config.create_interval_secs),
                Duration::ZERO,
                |ctx| async move { jobs::create_snapshots(&ctx, Utc::now()).await },
            );
        }
        if config.enable_snapshot_send {
            let workers = config.send_routines.max(1);
            let interval = secs(config.send_interval_secs);
            for id in 1..=workers {
                self.spawn_loop(
                    "send-snapshots",
                    interval,
                    jitter::stagger(interval, workers, id),
                    move |ctx| async move { jobs::send_snapshots(&ctx, id, Utc::now()).await },
                );
            }
        }
        if config.enable_snapshot_mark {
            self.spawn_loop(
                "mark-snapshots",
                secs(config.mark_interval_secs),
                Duration::ZERO,
                |ctx| async move { jobs::mark_prunable_snapshots(&ctx, Utc::now()).await },
            );
        }
        if config.enable_snapshot_prune {
            self.spawn_loop(
                "prune-snapshots",
                secs(config.prune_snapshot_interval_secs),
                Duration::ZERO,
                |ctx| async move { jobs::prune_snapshots(&ctx, Utc::now()).await },
            );
        }
        if config.enable_filesystem_prune {
            self.spawn_loop(
                "prune-filesystems",
                secs(config.prune_filesystem_interval_secs),
                Duration::ZERO,
                |ctx| async move { jobs::prune_filesystems(&ctx, Utc::now()).await },
            );
        }
        info!(loops = self.tasks.len(), "runner started");
    }

    fn spawn_loop<F, Fut>(&mut self, job: &'static str, base: Duration, delay: Duration, pass: F)
    where
        F: Fn(Arc<JobContext>) -> Fut + Send + 'static,
        Fut: Future<Output = JobResult<Vec<String>>> + Send + 'static,
    {
        self.tasks
            .spawn(run_loop(self.ctx.clone(), job, base, delay, pass));
    }

    /// Cancels every loop and waits for them to finish their current pass.
    pub async fn shutdown(mut self) {
        self.ctx.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "job loop panicked");
            }
        }
        info!("runner stopped");
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

async fn run_loop<F, Fut>(
    ctx: Arc<JobContext>,
    job: &'static str,
    base: Duration,
    delay: Duration,
    pass: F,
) where
    F: Fn(Arc<JobContext>) -> Fut,
    Fut: Future<Output = JobResult<Vec<String>>>,
{
    let cancel = ctx.cancel.clone();
    if !delay.is_zero() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // interval() rejects a zero period
    let period = jitter::randomize(base).max(Duration::from_millis(1));
    info!(job, period_ms = period.as_millis() as u64, "job loop started");
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match pass(ctx.clone()).await {
            Ok(done) if done.is_empty() => debug!(job, "pass complete"),
            Ok(done) => info!(job, datasets = ?done, "pass complete"),
            Err(e) if e.is_cancelled() => {
                info!(job, error = %e, "pass interrupted by shutdown");
                break;
            }
            Err(e) => error!(job, error = %e, "pass failed"),
        }
    }
    info!(job, "job loop stopped");
}

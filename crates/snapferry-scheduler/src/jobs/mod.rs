//! The passes run by the lifecycle loops.
//!
//! Every pass takes the current time explicitly and returns the names of the
//! datasets it acted on. Datasets held by another job are skipped silently
//! and picked up on a later tick.

mod create;
mod mark;
mod prune;
mod send;

pub use create::create_snapshots;
pub use mark::mark_prunable_snapshots;
pub use prune::{prune_filesystems, prune_snapshots};
pub use send::send_snapshots;

use snapferry_storage::{
    dataset::strip_parent, Dataset, DatasetType, ListOptions, PropertyNames, StorageDriver,
};
use snapferry_transport::{Throttle, TransportResult};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::error::{JobError, JobResult};
use crate::events::{register_sending_listeners, EventBus};
use crate::lock::DatasetLocks;

/// State shared by every pass and loop.
pub struct JobContext {
    /// Local storage.
    pub driver: Arc<dyn StorageDriver>,
    /// Runner settings.
    pub config: RunnerConfig,
    /// Per-dataset exclusion shared by all jobs.
    pub locks: DatasetLocks,
    /// Event bus with the standing listeners registered.
    pub events: EventBus,
    /// Process-wide shutdown signal.
    pub cancel: CancellationToken,
    send_throttle: Arc<Throttle>,
}

impl JobContext {
    /// Builds a context and registers the standing event listeners.
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        config: RunnerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let events = EventBus::new();
        register_sending_listeners(&events, driver.clone(), &config.properties);
        Self {
            send_throttle: Arc::new(Throttle::new(config.send_bytes_per_second)),
            driver,
            config,
            locks: DatasetLocks::new(),
            events,
            cancel,
        }
    }

    pub(crate) fn names(&self) -> &PropertyNames {
        &self.config.properties
    }

    pub(crate) fn send_throttle(&self) -> Arc<Throttle> {
        self.send_throttle.clone()
    }

    pub(crate) fn check_cancelled(&self) -> JobResult<()> {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    /// Name relative to the parent dataset.
    pub(crate) fn logical_name<'a>(&self, name: &'a str) -> &'a str {
        strip_parent(&self.config.parent_dataset, name)
    }

    /// Filesystems below the parent, with the policy properties resolved.
    pub(crate) async fn managed_filesystems(&self) -> JobResult<Vec<Dataset>> {
        let opts = ListOptions::recursive(DatasetType::Filesystem, &self.config.parent_dataset)
            .with_props(self.names().filesystem_props());
        let parent = self.config.parent_dataset.as_str();
        Ok(self
            .driver
            .list_datasets(opts)
            .await?
            .into_iter()
            .filter(|ds| ds.name != parent)
            .collect())
    }

    /// Snapshots of one filesystem, oldest first.
    pub(crate) async fn snapshots_of(&self, filesystem: &str) -> JobResult<Vec<Dataset>> {
        let opts = ListOptions::recursive(DatasetType::Snapshot, filesystem)
            .with_props(self.names().snapshot_props());
        Ok(self
            .driver
            .list_datasets(opts)
            .await?
            .into_iter()
            .filter(|ds| ds.filesystem_name() == filesystem)
            .collect())
    }

    /// Runs a remote metadata request under the configured deadline.
    pub(crate) async fn remote<T, F>(&self, request: F) -> JobResult<T>
    where
        F: Future<Output = TransportResult<T>>,
    {
        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, request).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(JobError::Timeout(timeout)),
        }
    }
}

//! Job events and their listeners.
//!
//! Listeners run in subscription order and are awaited one after another
//! inside `emit`, so a listener for `TransferStarted` has finished before the
//! transfer begins. Listener failures are logged by the listener itself and
//! never abort the job that emitted the event.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use snapferry_storage::{dataset::split_snapshot_name, PropertyNames, StorageDriver};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error};

/// Something a job did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum JobEvent {
    /// A snapshot transfer is about to start.
    TransferStarted {
        /// Full local snapshot name.
        snapshot: String,
    },
    /// A snapshot transfer ended.
    TransferCompleted {
        /// Full local snapshot name.
        snapshot: String,
        /// Whether the remote accepted it.
        succeeded: bool,
    },
    /// The create job made a snapshot.
    SnapshotCreated {
        /// Full snapshot name.
        snapshot: String,
    },
    /// The mark job scheduled a snapshot for deletion.
    SnapshotMarked {
        /// Full snapshot name.
        snapshot: String,
        /// RFC3339 deletion deadline.
        delete_at: String,
    },
    /// A snapshot was destroyed.
    DeletedSnapshot {
        /// Full snapshot name.
        snapshot: String,
        /// Name relative to the parent dataset.
        logical_name: String,
    },
    /// A filesystem was destroyed.
    DeletedFilesystem {
        /// Full filesystem name.
        filesystem: String,
        /// Name relative to the parent dataset.
        logical_name: String,
    },
}

/// Discriminant of a [`JobEvent`], used to subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`JobEvent::TransferStarted`].
    TransferStarted,
    /// [`JobEvent::TransferCompleted`].
    TransferCompleted,
    /// [`JobEvent::SnapshotCreated`].
    SnapshotCreated,
    /// [`JobEvent::SnapshotMarked`].
    SnapshotMarked,
    /// [`JobEvent::DeletedSnapshot`].
    DeletedSnapshot,
    /// [`JobEvent::DeletedFilesystem`].
    DeletedFilesystem,
}

impl JobEvent {
    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            JobEvent::TransferStarted { .. } => EventKind::TransferStarted,
            JobEvent::TransferCompleted { .. } => EventKind::TransferCompleted,
            JobEvent::SnapshotCreated { .. } => EventKind::SnapshotCreated,
            JobEvent::SnapshotMarked { .. } => EventKind::SnapshotMarked,
            JobEvent::DeletedSnapshot { .. } => EventKind::DeletedSnapshot,
            JobEvent::DeletedFilesystem { .. } => EventKind::DeletedFilesystem,
        }
    }
}

type Listener = Arc<dyn Fn(JobEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registry of event listeners, shared by every job.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<HashMap<EventKind, Vec<Listener>>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.read();
        f.debug_struct("EventBus")
            .field("kinds", &listeners.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EventBus {
    /// Creates a bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener for one kind of event.
    pub fn subscribe<F, Fut>(&self, kind: EventKind, listener: F)
    where
        F: Fn(JobEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener: Listener = Arc::new(move |event| Box::pin(listener(event)));
        self.listeners.write().entry(kind).or_default().push(listener);
    }

    /// Runs every listener of the event's kind, in subscription order.
    pub async fn emit(&self, event: JobEvent) {
        let listeners = self
            .listeners
            .read()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        debug!(?event, listeners = listeners.len(), "emit");
        for listener in listeners {
            listener(event.clone()).await;
        }
    }

    /// Number of listeners for a kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map(Vec::len).unwrap_or(0)
    }
}

/// Subscribes the listeners that publish the in-flight snapshot on its
/// filesystem, so other tools see which snapshot must not be destroyed.
pub fn register_sending_listeners(
    bus: &EventBus,
    driver: Arc<dyn StorageDriver>,
    names: &PropertyNames,
) {
    let started_driver = driver.clone();
    let property = names.sending_snapshot.clone();
    bus.subscribe(EventKind::TransferStarted, move |event| {
        let driver = started_driver.clone();
        let property = property.clone();
        async move {
            let JobEvent::TransferStarted { snapshot } = event else {
                return;
            };
            let Some((filesystem, short)) = split_snapshot_name(&snapshot) else {
                error!(snapshot, "transfer started for a non-snapshot name");
                return;
            };
            if let Err(e) = driver.set_property(filesystem, &property, short).await {
                error!(filesystem, error = %e, "could not record sending snapshot");
            }
        }
    });

    let property = names.sending_snapshot.clone();
    bus.subscribe(EventKind::TransferCompleted, move |event| {
        let driver = driver.clone();
        let property = property.clone();
        async move {
            let JobEvent::TransferCompleted { snapshot, .. } = event else {
                return;
            };
            let Some((filesystem, _)) = split_snapshot_name(&snapshot) else {
                error!(snapshot, "transfer completed for a non-snapshot name");
                return;
            };
            if let Err(e) = driver.inherit_property(filesystem, &property).await {
                error!(filesystem, error = %e, "could not clear sending snapshot");
            }
        }
    });
}

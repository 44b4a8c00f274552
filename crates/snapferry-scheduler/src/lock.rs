//! Non-blocking per-dataset mutual exclusion.
//!
//! Jobs never wait for a dataset: if another job holds it, the caller skips
//! the dataset and picks it up again on a later tick.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// Set of dataset names currently held by a job.
#[derive(Debug, Clone, Default)]
pub struct DatasetLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl DatasetLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock on `dataset`, or returns `None` if it is already held.
    ///
    /// The lock is released when the guard drops.
    pub fn try_lock(&self, dataset: &str) -> Option<DatasetLockGuard> {
        let mut held = self.held.lock();
        if !held.insert(dataset.to_string()) {
            trace!(dataset, "dataset busy");
            return None;
        }
        Some(DatasetLockGuard {
            held: self.held.clone(),
            dataset: dataset.to_string(),
        })
    }

    /// Returns true while some job holds `dataset`.
    pub fn is_locked(&self, dataset: &str) -> bool {
        self.held.lock().contains(dataset)
    }

    /// Number of datasets currently held.
    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    /// Returns true if nothing is held.
    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }
}

/// Proof of holding a dataset lock.
#[derive(Debug)]
pub struct DatasetLockGuard {
    held: Arc<Mutex<HashSet<String>>>,
    dataset: String,
}

impl DatasetLockGuard {
    /// The locked dataset.
    pub fn dataset(&self) -> &str {
        &self.dataset
    }
}

impl Drop for DatasetLockGuard {
    fn drop(&mut self) {
        self.held.lock().remove(&self.dataset);
    }
}

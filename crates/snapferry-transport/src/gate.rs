//! Admission gate for receive requests.
//!
//! A fixed number of permits bounds the receives running at once. A request
//! that finds no free permit is turned away immediately instead of queueing,
//! so admitted transfers keep predictable latency.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting gate over a semaphore, non-blocking admission only.
#[derive(Debug, Clone)]
pub struct ReceiveGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Held for the lifetime of one admitted receive; dropping it frees the slot.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ReceiveGate {
    /// Creates a gate with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Takes a slot if one is free.
    pub fn try_admit(&self) -> Option<GatePermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| GatePermit { _permit: permit })
    }

    /// Receives currently admitted.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#![warn(missing_docs)]

//! snapferry subsystem: per-dataset locks, job events and the periodic snapshot lifecycle runner.

pub mod config;
pub mod error;
pub mod events;
pub mod jitter;
pub mod jobs;
pub mod lock;
pub mod runner;

pub use config::RunnerConfig;
pub use error::{JobError, JobResult};
pub use events::{EventBus, EventKind, JobEvent};
pub use jobs::JobContext;
pub use lock::{DatasetLockGuard, DatasetLocks};
pub use runner::Runner;

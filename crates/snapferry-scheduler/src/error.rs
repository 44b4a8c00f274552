//! Error types for the lifecycle jobs.

use snapferry_storage::{DatasetType, DriverError, PropertyError};
use snapferry_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Errors a job pass can fail with.
#[derive(Debug, Error)]
pub enum JobError {
    /// The runner is shutting down.
    #[error("job cancelled")]
    Cancelled,

    /// Local storage failure.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// Remote side failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A coordination property holds a value that does not parse.
    #[error(transparent)]
    MalformedProperty(#[from] PropertyError),

    /// A dataset marked for deletion is not the kind the pass handles.
    #[error("{dataset} is a {actual:?}, expected {expected:?}")]
    UnexpectedType {
        /// Dataset name.
        dataset: String,
        /// Type the pass handles.
        expected: DatasetType,
        /// Type the driver reported.
        actual: DatasetType,
    },

    /// A remote metadata request did not answer in time.
    #[error("remote request timed out after {0:?}")]
    Timeout(Duration),
}

impl JobError {
    /// Cancellation is an expected way for a pass to end.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}

/// Result alias for job passes.
pub type JobResult<T> = Result<T, JobError>;

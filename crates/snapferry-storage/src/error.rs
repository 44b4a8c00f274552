//! Error types for storage driver calls.

use thiserror::Error;

/// Result type alias for storage driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors reported by a storage driver.
///
/// Callers treat most variants opaquely. The ones they branch on are
/// [`DriverError::NotFound`], [`DriverError::NotASnapshot`] and
/// [`DriverError::ResumableStream`].
#[derive(Debug, Error)]
pub enum DriverError {
    /// The named dataset does not exist.
    #[error("dataset does not exist: {name}")]
    NotFound {
        /// Name of the missing dataset.
        name: String,
    },

    /// An operation that requires a snapshot was given another dataset type.
    #[error("dataset is not a snapshot: {name}")]
    NotASnapshot {
        /// Name of the offending dataset.
        name: String,
    },

    /// The destination dataset already exists.
    #[error("dataset already exists: {name}")]
    AlreadyExists {
        /// Name of the existing dataset.
        name: String,
    },

    /// The dataset name is not well formed.
    #[error("invalid dataset name: {name}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// A receive was interrupted and the partial state can be resumed.
    #[error("stream interrupted, resumable with token")]
    ResumableStream {
        /// Opaque token accepted by `resume_send` on the sending side.
        token: String,
    },

    /// A stream was incomplete or malformed and cannot be resumed.
    #[error("stream error: {msg}")]
    Stream {
        /// Description of the stream problem.
        msg: String,
    },

    /// Any other failure reported by the driver.
    #[error("driver command failed: {msg}")]
    Command {
        /// Driver supplied message.
        msg: String,
    },

    /// I/O error while moving stream bytes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Shorthand for a [`DriverError::NotFound`].
    pub fn not_found(name: impl Into<String>) -> Self {
        DriverError::NotFound { name: name.into() }
    }

    /// Shorthand for a [`DriverError::Stream`].
    pub fn stream(msg: impl Into<String>) -> Self {
        DriverError::Stream { msg: msg.into() }
    }

    /// Returns true if the error means the dataset does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound { .. })
    }

    /// The resume token carried by an interrupted receive, if any.
    pub fn resume_token(&self) -> Option<&str> {
        match self {
            DriverError::ResumableStream { token } => Some(token),
            _ => None,
        }
    }
}

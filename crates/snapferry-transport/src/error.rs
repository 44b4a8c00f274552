//! Error types for the replication transport.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use snapferry_storage::DriverError;
use thiserror::Error;
use tracing::{error, info};

use crate::protocol::HEADER_RESUME_TOKEN;

/// Errors seen by the HTTP client side.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be sent or the response not read.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an unexpected status.
    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Request URL.
        url: String,
        /// Response body, truncated.
        body: String,
        /// Resume token returned with the error, if any.
        resume_token: Option<String>,
    },

    /// The server rejected the request because its receive gate is full.
    #[error("remote is busy: too many concurrent receives")]
    TooManyRequests,

    /// The configured base URL is not usable.
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The transfer did not finish within the push timeout.
    #[error("push did not finish within {0:?}")]
    Timeout(std::time::Duration),

    /// A local driver call failed while producing or consuming a stream.
    #[error("local driver error: {0}")]
    Driver(#[from] DriverError),
}

impl TransportError {
    /// Resume token handed back by the remote, if the transfer can be resumed.
    pub fn resume_token(&self) -> Option<&str> {
        match self {
            TransportError::Status { resume_token, .. } => resume_token.as_deref(),
            _ => None,
        }
    }

    /// Returns true for a 404 from the remote.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::Status { status: 404, .. })
    }
}

/// Result type alias for client calls.
pub type TransportResult<T> = Result<T, TransportError>;

/// A failed request on the server side, rendered as a status code.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Driver failure.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Malformed request parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Requested object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The receive gate is full.
    #[error("too many concurrent receives")]
    TooManyRequests,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Driver(e) => match e {
                DriverError::NotFound { .. } => StatusCode::NOT_FOUND,
                DriverError::NotASnapshot { .. } | DriverError::InvalidName { .. } => {
                    StatusCode::BAD_REQUEST
                }
                DriverError::AlreadyExists { .. } => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            info!(error = %self, status = status.as_u16(), "request rejected");
        }

        // Driver text stays in the log for server errors.
        let body = if status.is_server_error() {
            "internal error".to_string()
        } else {
            self.to_string()
        };
        let mut response = (status, body).into_response();
        if let ApiError::Driver(e) = &self {
            if let Some(token) = e.resume_token() {
                if let Ok(value) = HeaderValue::from_str(token) {
                    response.headers_mut().insert(HEADER_RESUME_TOKEN, value);
                }
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_map_to_status() {
        let cases = [
            (DriverError::not_found("p/fs"), StatusCode::NOT_FOUND),
            (
                DriverError::NotASnapshot { name: "p/fs".into() },
                StatusCode::BAD_REQUEST,
            ),
            (
                DriverError::AlreadyExists { name: "p/fs".into() },
                StatusCode::CONFLICT,
            ),
            (DriverError::stream("short"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn resumable_error_carries_token_header() {
        let err = ApiError::Driver(DriverError::ResumableStream {
            token: "abc123".into(),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[HEADER_RESUME_TOKEN], "abc123");
    }

    #[test]
    fn too_many_requests_status() {
        assert_eq!(
            ApiError::TooManyRequests.into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn client_error_helpers() {
        let err = TransportError::Status {
            status: 404,
            url: "http://x/filesystems/a/snapshots".into(),
            body: String::new(),
            resume_token: None,
        };
        assert!(err.is_not_found());
        assert!(err.resume_token().is_none());
    }
}

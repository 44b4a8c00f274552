//! HTTP server configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Settings of the replication HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address.
    pub bind_addr: SocketAddr,
    /// Path prefix all routes are mounted under, empty for none.
    pub prefix: String,
    /// Dataset the exposed filesystems live under. Wire names are relative to it.
    pub parent_dataset: String,
    /// Accepted authentication tokens. Empty disables authentication.
    pub auth_tokens: Vec<String>,
    /// Receives admitted at the same time; further ones get 429.
    pub max_concurrent_receives: usize,
    /// Aggregate stream bandwidth, 0 = unlimited.
    pub max_bytes_per_second: u64,
    /// Deadline for a single stream request, none when unset.
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7654)),
            prefix: String::new(),
            parent_dataset: String::from("pool"),
            auth_tokens: Vec::new(),
            max_concurrent_receives: 2,
            max_bytes_per_second: 0,
            request_timeout_secs: None,
        }
    }
}

impl HttpConfig {
    /// Per-request deadline as a duration.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// Prefix normalised to `/x/y` form, or empty.
    pub fn normalized_prefix(&self) -> String {
        let trimmed = self.prefix.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        }
    }
}

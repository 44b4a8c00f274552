//! Runner configuration.

use serde::{Deserialize, Serialize};
use snapferry_storage::PropertyNames;
use std::time::Duration;

/// Settings of the lifecycle runner.
///
/// Intervals are base values; each loop randomizes its own once at start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Dataset whose descendants the runner manages.
    pub parent_dataset: String,
    /// Names of the coordination properties.
    pub properties: PropertyNames,

    /// Run the create loop.
    pub enable_snapshot_create: bool,
    /// Run the send workers.
    pub enable_snapshot_send: bool,
    /// Run the mark loop.
    pub enable_snapshot_mark: bool,
    /// Run the snapshot prune loop.
    pub enable_snapshot_prune: bool,
    /// Run the filesystem prune loop.
    pub enable_filesystem_prune: bool,

    /// Base interval of the create loop, seconds.
    pub create_interval_secs: u64,
    /// Base interval of each send worker, seconds.
    pub send_interval_secs: u64,
    /// Base interval of the mark loop, seconds.
    pub mark_interval_secs: u64,
    /// Base interval of the snapshot prune loop, seconds.
    pub prune_snapshot_interval_secs: u64,
    /// Base interval of the filesystem prune loop, seconds.
    pub prune_filesystem_interval_secs: u64,
    /// Number of concurrent send workers.
    pub send_routines: usize,

    /// Name of created snapshots; `%UNIXTIME%` is replaced by the creation time.
    pub snapshot_name_template: String,
    /// Snapshot interval for filesystems without the interval property.
    pub default_snapshot_interval_minutes: Option<u64>,
    /// Retention count for filesystems without the count property.
    pub default_retention_count: Option<u64>,
    /// Retention age for filesystems without the minutes property.
    pub default_retention_minutes: Option<u64>,
    /// Delay between marking a snapshot and its deadline, seconds.
    pub delete_grace_secs: u64,

    /// Token presented to remote servers.
    pub send_auth_token: Option<String>,
    /// Ask remotes to keep partial state of interrupted receives.
    pub send_resumable: bool,
    /// Send streams raw.
    pub send_raw: bool,
    /// Embed dataset properties in sent streams.
    pub send_include_properties: bool,
    /// Upload bandwidth shared by all workers, 0 = unlimited.
    pub send_bytes_per_second: u64,
    /// Deadline of remote metadata requests, seconds.
    pub request_timeout_secs: u64,
    /// Deadline of one snapshot transfer, seconds.
    pub send_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            parent_dataset: String::from("pool"),
            properties: PropertyNames::default(),
            enable_snapshot_create: true,
            enable_snapshot_send: true,
            enable_snapshot_mark: true,
            enable_snapshot_prune: true,
            enable_filesystem_prune: true,
            create_interval_secs: 60,
            send_interval_secs: 60,
            mark_interval_secs: 60,
            prune_snapshot_interval_secs: 60,
            prune_filesystem_interval_secs: 60,
            send_routines: 1,
            snapshot_name_template: String::from("backup_%UNIXTIME%"),
            default_snapshot_interval_minutes: None,
            default_retention_count: None,
            default_retention_minutes: None,
            delete_grace_secs: 60,
            send_auth_token: None,
            send_resumable: true,
            send_raw: false,
            send_include_properties: false,
            send_bytes_per_second: 0,
            request_timeout_secs: 20,
            send_timeout_secs: 3600,
        }
    }
}

impl RunnerConfig {
    /// Grace period as a chrono duration.
    pub fn delete_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.delete_grace_secs as i64)
    }

    /// Deadline of remote metadata requests.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Deadline of one snapshot transfer.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Snapshot name for a creation at `unix_secs`.
    pub fn snapshot_name(&self, unix_secs: i64) -> String {
        self.snapshot_name_template
            .replace("%UNIXTIME%", &unix_secs.to_string())
    }
}

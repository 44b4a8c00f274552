//! Storage driver capability interface.
//!
//! The scheduler and the HTTP transport never touch datasets directly; every
//! mutation and every stream goes through a [`StorageDriver`]. Implementations
//! wrap the real on-disk tooling; [`crate::memory::MemoryDriver`] is the
//! in-process reference implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::dataset::{Dataset, DatasetType};
use crate::error::DriverResult;

/// Driver property holding the token of an interrupted resumable receive.
pub const PROPERTY_RECEIVE_RESUME_TOKEN: &str = "receive_resume_token";
/// Native creation time property, unix seconds.
pub const PROPERTY_CREATION: &str = "creation";
/// Native unique identifier property.
pub const PROPERTY_GUID: &str = "guid";

/// Boxed byte sink handed to `send_stream`.
pub type StreamWriter<'a> = dyn AsyncWrite + Send + Unpin + 'a;
/// Boxed byte source handed to `receive_stream`.
pub type StreamReader<'a> = dyn AsyncRead + Send + Unpin + 'a;

/// Options for listing datasets.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Only return datasets of this type.
    pub dataset_type: DatasetType,
    /// Only return this dataset and its descendants. Empty means everything.
    pub parent: String,
    /// Descend into children. Without it only `parent` itself is listed.
    pub recursive: bool,
    /// Extra properties to fetch into [`Dataset::extra_props`].
    pub extra_props: Vec<String>,
}

impl ListOptions {
    /// Recursive listing of one type under `parent`.
    pub fn recursive(dataset_type: DatasetType, parent: impl Into<String>) -> Self {
        Self {
            dataset_type,
            parent: parent.into(),
            recursive: true,
            extra_props: Vec::new(),
        }
    }

    /// Adds extra properties to fetch.
    pub fn with_props<I, S>(mut self, props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_props.extend(props.into_iter().map(Into::into));
        self
    }
}

/// Flags for [`StorageDriver::destroy_dataset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestroyFlags {
    /// Destroy all descendants too.
    pub recursive: bool,
    /// Mark snapshots for deferred deletion instead of failing when busy.
    pub defer_deletion: bool,
    /// Force unmount before destroying.
    pub force_unmount: bool,
}

/// Options for [`StorageDriver::send_stream`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Send the data exactly as stored on disk.
    pub raw: bool,
    /// Embed the dataset's properties in the stream.
    pub include_properties: bool,
    /// Full name of the snapshot to compute an incremental stream from.
    pub incremental_base: Option<String>,
}

/// Options for [`StorageDriver::receive_stream`].
#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    /// Keep partial state on interruption so the transfer can be resumed.
    pub resumable: bool,
    /// Properties to set on the received dataset.
    pub properties: HashMap<String, String>,
}

/// Capability interface of the storage driver.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Lists datasets matching `opts`.
    async fn list_datasets(&self, opts: ListOptions) -> DriverResult<Vec<Dataset>>;

    /// Maps dataset name to value for datasets under `parent` that have
    /// `property` set locally (inherited values are ignored).
    async fn list_with_property(
        &self,
        dataset_type: DatasetType,
        parent: &str,
        property: &str,
    ) -> DriverResult<HashMap<String, String>>;

    /// Fetches one dataset.
    async fn get_dataset(&self, name: &str, extra_props: &[String]) -> DriverResult<Dataset>;

    /// Sets a property locally on a dataset.
    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> DriverResult<()>;

    /// Clears a local property so the parent's value applies again.
    async fn inherit_property(&self, dataset: &str, key: &str) -> DriverResult<()>;

    /// Creates `dataset@name`, optionally for all descendants too.
    async fn create_snapshot(&self, dataset: &str, name: &str, recursive: bool)
        -> DriverResult<Dataset>;

    /// Destroys a dataset.
    async fn destroy_dataset(&self, dataset: &str, flags: DestroyFlags) -> DriverResult<()>;

    /// Writes a send stream for `snapshot` into `writer`.
    async fn send_stream(
        &self,
        snapshot: &str,
        writer: &mut StreamWriter<'_>,
        opts: SendOptions,
    ) -> DriverResult<()>;

    /// Receives a stream from `reader` into `name` (a filesystem or snapshot name)
    /// and returns the snapshot it produced.
    async fn receive_stream(
        &self,
        reader: &mut StreamReader<'_>,
        name: &str,
        opts: ReceiveOptions,
    ) -> DriverResult<Dataset>;

    /// Continues an interrupted send identified by a receive resume token.
    async fn resume_send(&self, writer: &mut StreamWriter<'_>, token: &str) -> DriverResult<()>;

    /// Lists descendants of `dataset`; depth 0 means unlimited.
    async fn children(&self, dataset: &str, depth: u64) -> DriverResult<Vec<Dataset>>;
}

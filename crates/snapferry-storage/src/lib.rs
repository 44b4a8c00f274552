#![warn(missing_docs)]

//! snapferry storage subsystem: dataset model, storage driver interface, coordination properties

pub mod coordination;
pub mod dataset;
pub mod driver;
pub mod error;
pub mod memory;
mod stream;

pub use coordination::{PropertyError, PropertyNames, RetentionPolicy, SnapshotState};
pub use dataset::{Dataset, DatasetType};
pub use driver::{DestroyFlags, ListOptions, ReceiveOptions, SendOptions, StorageDriver};
pub use error::{DriverError, DriverResult};
pub use memory::MemoryDriver;

#![warn(missing_docs)]

//! snapferry daemon: configuration, command line and process wiring.

pub mod cli;
pub mod config;
pub mod daemon;

pub use config::DaemonConfig;
pub use daemon::{run, serve};

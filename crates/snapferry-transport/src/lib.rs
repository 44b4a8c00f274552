#![warn(missing_docs)]

//! snapferry transport subsystem: authenticated HTTP replication surface, receive gate, byte throttle, client

pub mod client;
pub mod config;
pub mod error;
pub mod gate;
mod handlers;
pub mod protocol;
pub mod security;
pub mod server;
pub mod throttle;

pub use client::{PushSource, ReceiveRequest, TransportClient};
pub use config::HttpConfig;
pub use error::{ApiError, TransportError, TransportResult};
pub use gate::ReceiveGate;
pub use server::{router, serve, TransportState};
pub use throttle::{Throttle, ThrottledReader};

#![forbid(unsafe_code)]

pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod metrics;
pub mod paths;
pub mod protocol;
pub mod telemetry;

pub use error::{ConnectError, Error, ProtocolError, ServerError, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the main surface at crate root for convenience
pub use client::Client;
pub use daemon::{Server, ServerHandle};
pub use metrics::{Metrics, MetricsSnapshot};
pub use protocol::{Envelope, Event, EventKind, Scope, Subscribe};

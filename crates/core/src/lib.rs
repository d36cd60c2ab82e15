//! LAN speed test: an HTTP server exposing latency and throughput endpoints
//! and a client measuring them over several concurrent connections.

/// HTTP client transport and target checks.
pub mod client;

/// Command line, environment and file configuration.
pub mod config;

/// Rate estimation, connection pooling and the transfer strategies.
pub mod measurement;

/// Orchestration of a full measurement run.
pub mod runner;

/// Speed test endpoints served with axum.
pub mod server;

/// Tracing subscriber setup.
pub mod tracing;

pub mod util;

/// Scripted transports and observers for tests.
pub mod test_utils;

pub use runner::{RunError, SpeedTest, SpeedTestReport, SpeedTestSettings};

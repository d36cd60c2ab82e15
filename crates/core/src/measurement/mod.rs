//! Throughput measurement engine.
//!
//! A measurement run is split in phases (latency, download, upload). Each
//! throughput phase drives a [`ConnectionPool`] of concurrent connections,
//! all of them feeding a single [`EstimatorSession`] which keeps a trailing
//! one-second window of transfer events to derive the live and best rates.
//!
//! How bytes are moved on a connection is decided by a [`TransferStrategy`]:
//! [`DownloadStrategy`] drains a streaming response while
//! [`UploadStrategy`] either streams one long request body or loops over
//! discrete requests. [`UploadFallbackSelector`] picks the upload mode and
//! re-runs the phase in loop mode when streaming is unavailable or degenerate.

use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

mod download;
mod errors;
mod estimator;
mod latency;
mod observer;
mod pool;
mod transport;
mod upload;

pub use download::{measure_download, DownloadStrategy};
pub use errors::TransferError;
pub use estimator::{EstimatorSession, RateSnapshot, SlidingWindowEstimator};
pub use latency::{measure_latency, timed_ping, LatencyReport};
pub use observer::{NoopObserver, Phase, ProgressObserver, RateUpdate};
pub use pool::{
    ConnectionContext, ConnectionOutcome, ConnectionPool, PhaseSettings, Termination,
    TransferStrategy,
};
pub use transport::{
    ByteStream, SpeedTestTransport, UploadBody, UploadPayload, UploadReceipt,
};
pub use upload::{UploadFallbackSelector, UploadMode, UploadStrategy};

/// Length of a throughput phase.
pub const DEFAULT_PHASE_DURATION: Duration = Duration::from_millis(10_000);
/// Span of the trailing window used for the instantaneous rate.
pub const DEFAULT_WINDOW_SPAN: Duration = Duration::from_millis(1_000);
/// Concurrent connections per throughput phase.
pub const DEFAULT_CONNECTIONS: usize = 4;
/// Body size of one upload chunk (1 MiB).
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;
/// Number of latency samples.
pub const DEFAULT_PING_SAMPLES: usize = 5;
/// Delay between two latency samples.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(100);
/// Longest wait for one ping answer before the sample counts as failed.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);
/// Idle time between two phases of a run.
pub const DEFAULT_PHASE_PAUSE: Duration = Duration::from_millis(500);
/// Multiple of the chunk size at or below which a streaming upload is
/// considered to have been buffered instead of streamed.
pub const STREAMING_FALLBACK_FACTOR: u64 = 2;

/// Converts a rate in bits per second to binary megabits per second.
pub fn bits_to_mbps(bits_per_second: f64) -> f64 {
    bits_per_second / 1024.0 / 1024.0
}

/// Direction of a throughput phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Download,
    Upload,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Download => write!(f, "download"),
            Role::Upload => write!(f, "upload"),
        }
    }
}

/// One unit of data observed on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    pub timestamp: Instant,
    pub bytes: u64,
}

impl TransferEvent {
    pub fn new(timestamp: Instant, bytes: u64) -> Self {
        Self { timestamp, bytes }
    }
}

/// Final figures of a throughput phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub total_bytes: u64,
    pub duration_seconds: f64,
    pub average_mbps: f64,
    pub best_mbps: f64,
}

impl TransferResult {
    pub(crate) fn from_totals(total_bytes: u64, elapsed: Duration, best_bps: f64) -> Self {
        let duration_seconds = elapsed.as_secs_f64();
        let average_bps = if duration_seconds > 0.0 {
            (total_bytes as f64 * 8.0) / duration_seconds
        } else {
            0.0
        };
        Self {
            total_bytes,
            duration_seconds,
            average_mbps: bits_to_mbps(average_bps),
            best_mbps: bits_to_mbps(best_bps),
        }
    }
}

impl Display for TransferResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} bytes in {:.2}s, average {:.2} Mbps, best {:.2} Mbps",
            self.total_bytes, self.duration_seconds, self.average_mbps, self.best_mbps
        )
    }
}

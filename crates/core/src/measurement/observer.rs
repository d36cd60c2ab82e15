use std::fmt::{Display, Formatter};
use std::time::Duration;

use super::Role;

/// Stage of a measurement run, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Latency,
    Download,
    Upload,
    Complete,
    Failed,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Phase::Latency => "PING",
            Phase::Download => "DOWNLOAD",
            Phase::Upload => "UPLOAD",
            Phase::Complete => "DONE",
            Phase::Failed => "ERROR",
        };
        f.write_str(label)
    }
}

/// Live rate published after every recorded transfer event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateUpdate {
    pub role: Role,
    pub current_mbps: f64,
    pub best_mbps: f64,
    pub elapsed: Duration,
    pub phase_duration: Duration,
}

/// Receives progress from a running measurement.
///
/// Callbacks run synchronously on the transfer path, once per received or
/// sent chunk, so implementations must return quickly and never block.
pub trait ProgressObserver: Send + Sync {
    fn on_rate(&self, _update: &RateUpdate) {}

    fn on_phase(&self, _phase: Phase) {}

    fn on_log(&self, _line: &str) {}
}

/// Observer discarding everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

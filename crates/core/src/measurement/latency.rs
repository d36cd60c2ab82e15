use std::fmt::{Display, Formatter};
use std::time::Duration;

use tokio::time::Instant;

use super::transport::SpeedTestTransport;
use super::{ProgressObserver, TransferError};

/// Outcome of the latency probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyReport {
    /// Mean round trip of the successful samples, `None` if all failed.
    pub mean: Option<Duration>,
    pub successful: usize,
    pub attempted: usize,
}

impl LatencyReport {
    pub fn mean_ms(&self) -> Option<f64> {
        self.mean.map(|mean| mean.as_secs_f64() * 1000.0)
    }
}

impl Display for LatencyReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.mean_ms() {
            Some(ms) => write!(f, "{ms:.1} ms"),
            None => f.write_str("N/A"),
        }
    }
}

/// One ping bounded by `limit`, returning its round trip.
pub async fn timed_ping<T: SpeedTestTransport + ?Sized>(
    transport: &T,
    limit: Duration,
) -> Result<Duration, TransferError> {
    let start = Instant::now();
    match tokio::time::timeout(limit, transport.ping()).await {
        Ok(Ok(())) => Ok(start.elapsed()),
        Ok(Err(error)) => Err(error),
        Err(_) => Err(TransferError::Timeout(limit)),
    }
}

/// Sends `samples` sequential pings, `interval` apart, and averages the
/// round trips of those that succeeded. A ping without an answer after
/// `timeout` counts as failed.
pub async fn measure_latency<T: SpeedTestTransport + ?Sized>(
    transport: &T,
    samples: usize,
    interval: Duration,
    timeout: Duration,
    observer: &dyn ProgressObserver,
) -> LatencyReport {
    let mut round_trips = Vec::with_capacity(samples);
    for sample in 0..samples {
        match timed_ping(transport, timeout).await {
            Ok(rtt) => {
                tracing::debug!(sample, rtt_ms = rtt.as_secs_f64() * 1000.0, "ping");
                round_trips.push(rtt);
            }
            Err(error) => {
                tracing::warn!(sample, %error, "ping failed");
                observer.on_log(&format!("ping {} failed: {error}", sample + 1));
            }
        }
        if sample + 1 < samples {
            tokio::time::sleep(interval).await;
        }
    }

    let mean = if round_trips.is_empty() {
        None
    } else {
        Some(round_trips.iter().sum::<Duration>() / round_trips.len() as u32)
    };
    let report = LatencyReport {
        mean,
        successful: round_trips.len(),
        attempted: samples,
    };
    tracing::info!(
        successful = report.successful,
        attempted = report.attempted,
        latency = %report,
        "latency probe finished"
    );
    report
}

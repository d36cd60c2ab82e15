//! Complete measurement run: reachability check, latency probe, download
//! phase, then upload phase.

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::measurement::{
    measure_download, measure_latency, timed_ping, NoopObserver, Phase, PhaseSettings,
    ProgressObserver, SpeedTestTransport, TransferError, TransferResult, UploadFallbackSelector,
    UploadMode, DEFAULT_PHASE_PAUSE, DEFAULT_PING_INTERVAL, DEFAULT_PING_SAMPLES,
    DEFAULT_PING_TIMEOUT, DEFAULT_UPLOAD_CHUNK_SIZE,
};

/// Conditions that stop a run before it produced any figures.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("server unreachable: {0}")]
    Unreachable(#[source] TransferError),

    #[error(
        "refusing to test against {host}, it is this machine (pass --allow-loopback to override)"
    )]
    LoopbackTarget { host: String },

    #[error("invalid server url {url}: {reason}")]
    InvalidServer { url: String, reason: String },
}

/// Tunables of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedTestSettings {
    /// Shape shared by the download and upload phases.
    pub phase: PhaseSettings,
    pub chunk_size: usize,
    pub ping_samples: usize,
    pub ping_interval: Duration,
    /// Longest wait for one ping answer, the reachability check included.
    pub ping_timeout: Duration,
    pub phase_pause: Duration,
    /// Upload with discrete requests without trying a streaming body first.
    pub force_loop_upload: bool,
}

impl Default for SpeedTestSettings {
    fn default() -> Self {
        Self {
            phase: PhaseSettings::default(),
            chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            ping_samples: DEFAULT_PING_SAMPLES,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            phase_pause: DEFAULT_PHASE_PAUSE,
            force_loop_upload: false,
        }
    }
}

/// Figures of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedTestReport {
    /// Mean round trip, `None` when every ping failed.
    pub latency_ms: Option<f64>,
    pub download: TransferResult,
    pub upload: TransferResult,
    pub upload_mode: UploadMode,
}

impl Display for SpeedTestReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.latency_ms {
            Some(ms) => writeln!(f, "Latency:  {ms:.1} ms")?,
            None => writeln!(f, "Latency:  N/A")?,
        }
        writeln!(
            f,
            "Download: {:.2} Mbps (best {:.2} Mbps)",
            self.download.average_mbps, self.download.best_mbps
        )?;
        write!(
            f,
            "Upload:   {:.2} Mbps (best {:.2} Mbps, {} mode)",
            self.upload.average_mbps, self.upload.best_mbps, self.upload_mode
        )
    }
}

/// Drives every phase of a run against one transport.
pub struct SpeedTest<T> {
    transport: Arc<T>,
    settings: SpeedTestSettings,
    observer: Arc<dyn ProgressObserver>,
}

impl<T: SpeedTestTransport> SpeedTest<T> {
    pub fn new(transport: Arc<T>, settings: SpeedTestSettings) -> Self {
        Self {
            transport,
            settings,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub async fn run(&self) -> Result<SpeedTestReport, RunError> {
        let settings = &self.settings;
        let observer = &self.observer;

        observer.on_phase(Phase::Latency);
        if let Err(error) = timed_ping(&*self.transport, settings.ping_timeout).await {
            tracing::error!(%error, "server did not answer the first request");
            observer.on_log(&format!("server unreachable: {error}"));
            observer.on_phase(Phase::Failed);
            return Err(RunError::Unreachable(error));
        }
        let latency = measure_latency(
            &*self.transport,
            settings.ping_samples,
            settings.ping_interval,
            settings.ping_timeout,
            observer.as_ref(),
        )
        .await;
        observer.on_log(&format!("latency: {latency}"));

        tokio::time::sleep(settings.phase_pause).await;
        observer.on_phase(Phase::Download);
        let download =
            measure_download(self.transport.clone(), settings.phase, observer.clone()).await;
        observer.on_log(&format!("download: {download}"));

        tokio::time::sleep(settings.phase_pause).await;
        observer.on_phase(Phase::Upload);
        let (upload, upload_mode) =
            UploadFallbackSelector::new(self.transport.clone(), settings.phase, settings.chunk_size)
                .force_loop(settings.force_loop_upload)
                .with_pause(settings.phase_pause)
                .run(observer.clone())
                .await;
        observer.on_log(&format!("upload ({upload_mode}): {upload}"));

        observer.on_phase(Phase::Complete);
        let report = SpeedTestReport {
            latency_ms: latency.mean_ms(),
            download,
            upload,
            upload_mode,
        };
        tracing::info!(
            latency_ms = ?report.latency_ms,
            download_mbps = report.download.average_mbps,
            upload_mbps = report.upload.average_mbps,
            %upload_mode,
            "speed test finished"
        );
        Ok(report)
    }
}

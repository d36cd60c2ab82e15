use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};

use super::pool::{PhaseReport, PhaseSettings};
use super::transport::{SpeedTestTransport, UploadBody, UploadPayload};
use super::{
    ConnectionContext, ConnectionOutcome, ConnectionPool, ProgressObserver, Role, Termination,
    TransferResult, TransferStrategy, DEFAULT_PHASE_PAUSE, STREAMING_FALLBACK_FACTOR,
};

/// Extra time granted to the server to answer a streaming upload once its
/// body has ended.
pub(crate) const STREAMING_RESPONSE_GRACE: Duration = Duration::from_secs(5);

/// How upload bytes are put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// One long-lived request per connection with a pull-driven body.
    Streaming,
    /// Back-to-back requests of one chunk each.
    Loop,
}

impl Display for UploadMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadMode::Streaming => f.write_str("streaming"),
            UploadMode::Loop => f.write_str("loop"),
        }
    }
}

/// Sends upload traffic on one connection in a fixed [`UploadMode`].
pub struct UploadStrategy<T> {
    transport: Arc<T>,
    mode: UploadMode,
    chunk: Bytes,
}

impl<T: SpeedTestTransport> UploadStrategy<T> {
    pub fn new(transport: Arc<T>, mode: UploadMode, chunk_size: usize) -> Self {
        Self {
            transport,
            mode,
            // content is irrelevant to the server, every request shares this buffer
            chunk: Bytes::from(vec![0u8; chunk_size]),
        }
    }

    async fn stream_body(&self, conn: ConnectionContext) -> ConnectionOutcome {
        let produced = Arc::new(AtomicU64::new(0));
        let body = producer_body(self.chunk.clone(), conn.clone(), produced.clone());
        let response_deadline = conn.deadline + STREAMING_RESPONSE_GRACE;

        let sent = self.transport.upload(UploadPayload::Streaming(body));
        match tokio::time::timeout_at(response_deadline, sent).await {
            Ok(Ok(receipt)) => {
                let produced = produced.load(Ordering::Relaxed);
                let bytes = receipt.received.unwrap_or(produced);
                tracing::debug!(conn = conn.id, produced, bytes, "streaming upload acknowledged");
                ConnectionOutcome::completed(bytes)
            }
            Ok(Err(error)) => {
                conn.report_error("streaming upload", &error);
                ConnectionOutcome::errored(produced.load(Ordering::Relaxed))
            }
            Err(_) => {
                tracing::debug!(
                    conn = conn.id,
                    "no response to streaming upload before grace period"
                );
                ConnectionOutcome::aborted(produced.load(Ordering::Relaxed))
            }
        }
    }

    async fn loop_chunks(&self, conn: ConnectionContext) -> ConnectionOutcome {
        let deadline = tokio::time::sleep_until(conn.deadline);
        tokio::pin!(deadline);

        let chunk_len = self.chunk.len() as u64;
        let mut bytes = 0u64;
        loop {
            let request = self.transport.upload(UploadPayload::Chunk(self.chunk.clone()));
            tokio::select! {
                biased;
                _ = &mut deadline => return ConnectionOutcome::aborted(bytes),
                sent = request => match sent {
                    Ok(receipt) => {
                        let acknowledged = receipt.received.unwrap_or(chunk_len);
                        if acknowledged > 0 {
                            bytes += acknowledged;
                            conn.session.record_bytes(acknowledged);
                        }
                    }
                    Err(error) => {
                        conn.report_error("upload request", &error);
                        return ConnectionOutcome::errored(bytes);
                    }
                },
            }
        }
    }
}

/// Request body yielding the shared chunk on every pull until the deadline.
/// Each pull is recorded as it happens.
fn producer_body(chunk: Bytes, conn: ConnectionContext, produced: Arc<AtomicU64>) -> UploadBody {
    let len = chunk.len() as u64;
    futures::stream::poll_fn(move |_| {
        if conn.is_expired() {
            return Poll::Ready(None);
        }
        produced.fetch_add(len, Ordering::Relaxed);
        conn.session.record_bytes(len);
        Poll::Ready(Some(Ok(chunk.clone())))
    })
    .boxed()
}

impl<T: SpeedTestTransport> TransferStrategy for UploadStrategy<T> {
    fn run_connection(&self, conn: ConnectionContext) -> BoxFuture<'_, ConnectionOutcome> {
        match self.mode {
            UploadMode::Streaming => self.stream_body(conn).boxed(),
            UploadMode::Loop => self.loop_chunks(conn).boxed(),
        }
    }
}

/// Why a streaming upload was replaced by a loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FallbackReason {
    Unsupported,
    Forced,
    Buffered { bytes: u64, threshold: u64 },
    Failed,
}

impl Display for FallbackReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackReason::Unsupported => f.write_str("streaming request bodies unsupported"),
            FallbackReason::Forced => f.write_str("loop mode requested"),
            FallbackReason::Buffered { bytes, threshold } => {
                write!(f, "server received only {bytes} bytes (threshold {threshold})")
            }
            FallbackReason::Failed => f.write_str("streaming request failed"),
        }
    }
}

/// Runs the upload phase in streaming mode when possible and falls back to
/// loop mode otherwise.
pub struct UploadFallbackSelector<T> {
    transport: Arc<T>,
    settings: PhaseSettings,
    chunk_size: usize,
    force_loop: bool,
    pause: Duration,
}

impl<T: SpeedTestTransport> UploadFallbackSelector<T> {
    pub fn new(transport: Arc<T>, settings: PhaseSettings, chunk_size: usize) -> Self {
        Self {
            transport,
            settings,
            chunk_size,
            force_loop: false,
            pause: DEFAULT_PHASE_PAUSE,
        }
    }

    /// Skips the streaming attempt entirely.
    pub fn force_loop(mut self, force: bool) -> Self {
        self.force_loop = force;
        self
    }

    /// Idle time between a discarded streaming attempt and the loop run.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    fn fallback_threshold(&self) -> u64 {
        STREAMING_FALLBACK_FACTOR * self.chunk_size as u64
    }

    /// Runs the phase and returns its result along with the mode that
    /// produced it. A discarded streaming attempt never leaks into the result.
    pub async fn run(&self, observer: Arc<dyn ProgressObserver>) -> (TransferResult, UploadMode) {
        tracing::info!(
            connections = self.settings.connections,
            duration_ms = self.settings.duration.as_millis() as u64,
            chunk_size = self.chunk_size,
            "starting upload phase"
        );

        let reason = if self.force_loop {
            FallbackReason::Forced
        } else if !self.transport.supports_streaming_upload() {
            FallbackReason::Unsupported
        } else {
            observer.on_log(&format!(
                "upload test: streaming mode, {:.1}s ({} connections)",
                self.settings.duration.as_secs_f64(),
                self.settings.connections
            ));
            let report = self.run_mode(UploadMode::Streaming, observer.clone()).await;
            match self.degeneracy(&report) {
                None => return (report.result, UploadMode::Streaming),
                Some(reason) => {
                    tokio::time::sleep(self.pause).await;
                    reason
                }
            }
        };

        tracing::info!(%reason, "uploading in loop mode");
        observer.on_log(&format!(
            "upload test: loop mode ({reason}), {:.1}s ({} connections)",
            self.settings.duration.as_secs_f64(),
            self.settings.connections
        ));
        let report = self.run_mode(UploadMode::Loop, observer).await;
        (report.result, UploadMode::Loop)
    }

    async fn run_mode(&self, mode: UploadMode, observer: Arc<dyn ProgressObserver>) -> PhaseReport {
        let session = self.settings.new_session(Role::Upload, observer);
        let strategy = UploadStrategy::new(self.transport.clone(), mode, self.chunk_size);
        ConnectionPool::new(strategy)
            .run_phase(self.settings.connections, self.settings.duration, session)
            .await
    }

    fn degeneracy(&self, report: &PhaseReport) -> Option<FallbackReason> {
        let threshold = self.fallback_threshold();
        if let Some(buffered) = report
            .outcomes
            .iter()
            .find(|o| o.termination != Termination::Errored && o.bytes_transferred <= threshold)
        {
            return Some(FallbackReason::Buffered {
                bytes: buffered.bytes_transferred,
                threshold,
            });
        }
        if report
            .outcomes
            .iter()
            .any(|o| o.termination == Termination::Errored)
        {
            return Some(FallbackReason::Failed);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::measurement::NoopObserver;
    use crate::test_utils::{Receipt, SimulatedTransport};

    const CHUNK: usize = 64 * 1024;

    fn settings(connections: usize, millis: u64) -> PhaseSettings {
        PhaseSettings {
            connections,
            duration: Duration::from_millis(millis),
            window_span: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn streaming_result_uses_server_count() {
        let transport =
            Arc::new(SimulatedTransport::new().with_upload_pace(Duration::from_millis(5)));
        let selector = UploadFallbackSelector::new(transport.clone(), settings(2, 300), CHUNK);
        let (result, mode) = selector.run(Arc::new(NoopObserver)).await;

        assert_eq!(mode, UploadMode::Streaming);
        assert_eq!(transport.streaming_uploads(), 2);
        assert_eq!(transport.chunk_uploads(), 0);
        assert!(result.total_bytes > 2 * STREAMING_FALLBACK_FACTOR * CHUNK as u64);
        assert_eq!(result.total_bytes % CHUNK as u64, 0);
    }

    #[test_log::test(tokio::test)]
    async fn buffered_streaming_falls_back_to_loop() {
        let transport = Arc::new(
            SimulatedTransport::new()
                .with_streaming_receipt(Receipt::Fixed(2 * CHUNK as u64))
                .with_upload_pace(Duration::from_millis(5)),
        );
        let selector = UploadFallbackSelector::new(transport.clone(), settings(2, 200), CHUNK);
        let (result, mode) = selector.run(Arc::new(NoopObserver)).await;

        assert_eq!(mode, UploadMode::Loop);
        assert_eq!(transport.streaming_uploads(), 2);
        assert!(transport.chunk_uploads() > 0);
        // every loop round is acknowledged in full
        assert_eq!(result.total_bytes, transport.chunk_uploads() as u64 * CHUNK as u64);
    }

    #[tokio::test]
    async fn missing_capability_goes_straight_to_loop() {
        let transport = Arc::new(
            SimulatedTransport::new()
                .without_streaming_upload()
                .with_upload_pace(Duration::from_millis(5)),
        );
        let selector = UploadFallbackSelector::new(transport.clone(), settings(4, 200), CHUNK);
        let (result, mode) = selector.run(Arc::new(NoopObserver)).await;

        assert_eq!(mode, UploadMode::Loop);
        assert_eq!(transport.streaming_uploads(), 0);
        assert!(result.total_bytes > 0);
    }

    #[tokio::test]
    async fn forced_loop_skips_streaming() {
        let transport =
            Arc::new(SimulatedTransport::new().with_upload_pace(Duration::from_millis(5)));
        let selector = UploadFallbackSelector::new(transport.clone(), settings(1, 150), CHUNK)
            .force_loop(true);
        let (_, mode) = selector.run(Arc::new(NoopObserver)).await;
        assert_eq!(mode, UploadMode::Loop);
        assert_eq!(transport.streaming_uploads(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn failed_streaming_request_falls_back() {
        let transport = Arc::new(
            SimulatedTransport::new()
                .with_streaming_receipt(Receipt::Fail)
                .with_upload_pace(Duration::from_millis(5)),
        );
        let selector = UploadFallbackSelector::new(transport.clone(), settings(2, 200), CHUNK);
        let (result, mode) = selector.run(Arc::new(NoopObserver)).await;
        assert_eq!(mode, UploadMode::Loop);
        assert!(result.total_bytes > 0);
    }

    #[tokio::test]
    async fn unparsable_receipt_counts_produced_bytes() {
        let transport = Arc::new(
            SimulatedTransport::new()
                .with_streaming_receipt(Receipt::Unparsable)
                .with_upload_pace(Duration::from_millis(5)),
        );
        let settings = settings(1, 200);
        let session = settings.new_session(Role::Upload, Arc::new(NoopObserver));
        let strategy = UploadStrategy::new(transport, UploadMode::Streaming, CHUNK);
        let report = ConnectionPool::new(strategy)
            .run_phase(1, settings.duration, session.clone())
            .await;
        assert_eq!(report.outcomes[0].termination, Termination::Completed);
        assert_eq!(
            report.result.total_bytes,
            session.snapshot().total_bytes,
            "produced bytes are the recorded ones"
        );
    }

    #[test_log::test(tokio::test)]
    async fn loop_error_keeps_partial_bytes() {
        let transport = Arc::new(
            SimulatedTransport::new()
                .with_chunk_failure_after(3)
                .with_upload_pace(Duration::from_millis(1)),
        );
        let settings = settings(1, 2_000);
        let session = settings.new_session(Role::Upload, Arc::new(NoopObserver));
        let strategy = UploadStrategy::new(transport.clone(), UploadMode::Loop, CHUNK);
        let report = ConnectionPool::new(strategy)
            .run_phase(1, settings.duration, session)
            .await;
        assert_eq!(report.outcomes, vec![ConnectionOutcome::errored(3 * CHUNK as u64)]);
        assert_eq!(transport.chunk_uploads(), 3);
    }

    #[tokio::test]
    async fn loop_counts_reported_bytes() {
        let transport = Arc::new(
            SimulatedTransport::new()
                .with_chunk_receipt(Receipt::Fixed(1000))
                .with_upload_pace(Duration::from_millis(5)),
        );
        let settings = settings(1, 200);
        let session = settings.new_session(Role::Upload, Arc::new(NoopObserver));
        let strategy = UploadStrategy::new(transport.clone(), UploadMode::Loop, CHUNK);
        let report = ConnectionPool::new(strategy)
            .run_phase(1, settings.duration, session)
            .await;
        assert_eq!(report.outcomes[0].termination, Termination::Aborted);
        // the request cut by the deadline is never acknowledged
        assert_eq!(report.result.total_bytes, transport.chunk_uploads() as u64 * 1000);
    }
}

//! Scripted stand-ins for the network side of a measurement, used by unit and
//! integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;

use crate::measurement::{
    ByteStream, Phase, ProgressObserver, RateUpdate, SpeedTestTransport, TransferError,
    UploadPayload, UploadReceipt,
};

/// What the simulated server answers to an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// Acknowledge every consumed byte.
    Echo,
    /// Acknowledge a fixed count regardless of the body.
    Fixed(u64),
    /// Answer with a body that cannot be parsed.
    Unparsable,
    /// Fail the request.
    Fail,
}

/// One scripted ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStep {
    Reply(Duration),
    Fail,
    /// Never answers.
    Stall,
}

#[derive(Debug, Default)]
struct Counters {
    pings: AtomicUsize,
    download_opens: AtomicUsize,
    streaming_uploads: AtomicUsize,
    chunk_uploads: AtomicUsize,
}

/// In-memory [`SpeedTestTransport`] with a scripted link.
///
/// Downloads yield a fixed chunk at a fixed interval. Uploads consume their
/// body at a fixed pace per chunk and answer according to a [`Receipt`].
#[derive(Debug)]
pub struct SimulatedTransport {
    download_chunk: usize,
    download_interval: Duration,
    download_limit: Option<usize>,
    download_error_after: Option<usize>,
    download_fails: bool,
    streaming_supported: bool,
    streaming_receipt: Receipt,
    chunk_receipt: Receipt,
    chunk_failure_after: Option<usize>,
    upload_pace: Duration,
    ping_script: Mutex<VecDeque<PingStep>>,
    ping_default: PingStep,
    counters: Counters,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self {
            download_chunk: 64 * 1024,
            download_interval: Duration::from_millis(10),
            download_limit: None,
            download_error_after: None,
            download_fails: false,
            streaming_supported: true,
            streaming_receipt: Receipt::Echo,
            chunk_receipt: Receipt::Echo,
            chunk_failure_after: None,
            upload_pace: Duration::from_millis(10),
            ping_script: Mutex::new(VecDeque::new()),
            ping_default: PingStep::Reply(Duration::from_millis(1)),
            counters: Counters::default(),
        }
    }

    /// Every download stream yields `chunk_size` bytes per `interval`.
    pub fn with_download(mut self, chunk_size: usize, interval: Duration) -> Self {
        self.download_chunk = chunk_size;
        self.download_interval = interval;
        self
    }

    /// Ends each download stream after `chunks` chunks.
    pub fn with_download_limit(mut self, chunks: usize) -> Self {
        self.download_limit = Some(chunks);
        self
    }

    /// Fails each download stream after `chunks` chunks.
    pub fn with_download_error_after(mut self, chunks: usize) -> Self {
        self.download_error_after = Some(chunks);
        self
    }

    /// Download streams cannot be opened.
    pub fn with_failing_download(mut self) -> Self {
        self.download_fails = true;
        self
    }

    pub fn without_streaming_upload(mut self) -> Self {
        self.streaming_supported = false;
        self
    }

    pub fn with_streaming_receipt(mut self, receipt: Receipt) -> Self {
        self.streaming_receipt = receipt;
        self
    }

    pub fn with_chunk_receipt(mut self, receipt: Receipt) -> Self {
        self.chunk_receipt = receipt;
        self
    }

    /// Chunk uploads fail once `acknowledged` of them succeeded.
    pub fn with_chunk_failure_after(mut self, acknowledged: usize) -> Self {
        self.chunk_failure_after = Some(acknowledged);
        self
    }

    /// Time spent sending one upload chunk.
    pub fn with_upload_pace(mut self, pace: Duration) -> Self {
        self.upload_pace = pace;
        self
    }

    /// Pings follow `steps` in order, then fall back to a quick reply.
    pub fn with_ping_script(self, steps: impl IntoIterator<Item = PingStep>) -> Self {
        self.ping_script.lock().extend(steps);
        self
    }

    /// Every request fails.
    pub fn with_unreachable_server(mut self) -> Self {
        self.ping_default = PingStep::Fail;
        self.download_fails = true;
        self.streaming_receipt = Receipt::Fail;
        self.chunk_receipt = Receipt::Fail;
        self
    }

    pub fn pings(&self) -> usize {
        self.counters.pings.load(Ordering::SeqCst)
    }

    pub fn download_opens(&self) -> usize {
        self.counters.download_opens.load(Ordering::SeqCst)
    }

    pub fn streaming_uploads(&self) -> usize {
        self.counters.streaming_uploads.load(Ordering::SeqCst)
    }

    /// Chunk uploads that were acknowledged.
    pub fn chunk_uploads(&self) -> usize {
        self.counters.chunk_uploads.load(Ordering::SeqCst)
    }

    fn answer(receipt: Receipt, consumed: u64) -> Result<UploadReceipt, TransferError> {
        match receipt {
            Receipt::Echo => Ok(UploadReceipt {
                received: Some(consumed),
            }),
            Receipt::Fixed(received) => Ok(UploadReceipt {
                received: Some(received),
            }),
            Receipt::Unparsable => Ok(UploadReceipt { received: None }),
            Receipt::Fail => Err(TransferError::Status {
                url: "/upload".into(),
                status: 500,
            }),
        }
    }

    fn open_download(&self) -> ByteStream {
        let chunk = Bytes::from(vec![b'a'; self.download_chunk]);
        let limit = self.download_limit;
        let error_after = self.download_error_after;
        let interval = tokio::time::interval(self.download_interval);

        futures::stream::unfold((interval, 0usize), move |(mut interval, sent)| {
            let chunk = chunk.clone();
            async move {
                if limit.is_some_and(|limit| sent >= limit) {
                    return None;
                }
                match error_after {
                    Some(n) if sent > n => return None,
                    Some(n) if sent == n => {
                        return Some((Err(TransferError::Closed), (interval, sent + 1)));
                    }
                    _ => {}
                }
                interval.tick().await;
                Some((Ok(chunk), (interval, sent + 1)))
            }
        })
        .boxed()
    }
}

impl SpeedTestTransport for SimulatedTransport {
    fn ping(&self) -> BoxFuture<'_, Result<(), TransferError>> {
        async move {
            self.counters.pings.fetch_add(1, Ordering::SeqCst);
            let step = self
                .ping_script
                .lock()
                .pop_front()
                .unwrap_or(self.ping_default);
            match step {
                PingStep::Reply(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
                PingStep::Fail => Err(TransferError::other("simulated ping failure")),
                PingStep::Stall => std::future::pending().await,
            }
        }
        .boxed()
    }

    fn download_stream(&self) -> BoxFuture<'_, Result<ByteStream, TransferError>> {
        async move {
            self.counters.download_opens.fetch_add(1, Ordering::SeqCst);
            if self.download_fails {
                return Err(TransferError::Status {
                    url: "/download-stream".into(),
                    status: 503,
                });
            }
            Ok(self.open_download())
        }
        .boxed()
    }

    fn upload(
        &self,
        payload: UploadPayload,
    ) -> BoxFuture<'_, Result<UploadReceipt, TransferError>> {
        async move {
            match payload {
                UploadPayload::Streaming(mut body) => {
                    self.counters.streaming_uploads.fetch_add(1, Ordering::SeqCst);
                    if !self.streaming_supported {
                        return Err(TransferError::other("streaming request bodies unsupported"));
                    }
                    let mut consumed = 0u64;
                    while let Some(chunk) = body.next().await {
                        let chunk = chunk.map_err(|error| TransferError::other(error.to_string()))?;
                        consumed += chunk.len() as u64;
                        tokio::time::sleep(self.upload_pace).await;
                    }
                    Self::answer(self.streaming_receipt, consumed)
                }
                UploadPayload::Chunk(chunk) => {
                    let acknowledged = self.chunk_uploads();
                    if self
                        .chunk_failure_after
                        .is_some_and(|limit| acknowledged >= limit)
                    {
                        return Err(TransferError::Closed);
                    }
                    tokio::time::sleep(self.upload_pace).await;
                    let receipt = Self::answer(self.chunk_receipt, chunk.len() as u64)?;
                    self.counters.chunk_uploads.fetch_add(1, Ordering::SeqCst);
                    Ok(receipt)
                }
            }
        }
        .boxed()
    }

    fn supports_streaming_upload(&self) -> bool {
        self.streaming_supported
    }
}

/// Observer keeping everything it is told.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    rates: Mutex<Vec<RateUpdate>>,
    phases: Mutex<Vec<Phase>>,
    lines: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn rates(&self) -> Vec<RateUpdate> {
        self.rates.lock().clone()
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.phases.lock().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl ProgressObserver for RecordingObserver {
    fn on_rate(&self, update: &RateUpdate) {
        self.rates.lock().push(*update);
    }

    fn on_phase(&self, phase: Phase) {
        self.phases.lock().push(phase);
    }

    fn on_log(&self, line: &str) {
        self.lines.lock().push(line.to_owned());
    }
}

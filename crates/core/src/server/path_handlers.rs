//! Handlers of the speed test endpoints.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE};
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;

use super::errors::ServerError;
use super::AppState;

/// Size served by `/download` when the query has no usable size.
pub(crate) const DEFAULT_DOWNLOAD_SIZE: u64 = 5 * 1024 * 1024;

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Serialize)]
pub(super) struct PingResponse {
    t: i64,
}

pub(super) async fn ping() -> impl IntoResponse {
    let now = chrono::Utc::now().timestamp_millis();
    ([(CACHE_CONTROL, "no-store")], Json(PingResponse { t: now }))
}

/// Leniently parses the `size` query parameter: leading digits only, with
/// missing, unparsable or zero values meaning [`DEFAULT_DOWNLOAD_SIZE`] and
/// negative values meaning an empty body.
pub(crate) fn parse_size(raw: Option<&str>) -> u64 {
    let Some(raw) = raw else {
        return DEFAULT_DOWNLOAD_SIZE;
    };
    let raw = raw.trim_start();
    let (negative, digits) = match raw.as_bytes().first() {
        Some(b'-') => (true, &raw[1..]),
        Some(b'+') => (false, &raw[1..]),
        _ => (false, raw),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    let digits = &digits[..end];
    if digits.is_empty() {
        return DEFAULT_DOWNLOAD_SIZE;
    }
    // overflowing values still have to hit the allocation limit
    let value = digits.parse::<u64>().unwrap_or(u64::MAX);
    match (negative, value) {
        (_, 0) => DEFAULT_DOWNLOAD_SIZE,
        (true, _) => 0,
        (false, value) => value,
    }
}

/// One-shot download of a materialized buffer.
pub(super) async fn download(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ServerError> {
    let requested = parse_size(params.get("size").map(String::as_str));
    let limit = state.limits.max_download_bytes;
    let unavailable = || ServerError::Allocation { requested, limit };
    if requested > limit {
        return Err(unavailable());
    }
    let len = usize::try_from(requested).map_err(|_| unavailable())?;
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).map_err(|_| unavailable())?;
    buffer.resize(len, b'a');
    tracing::debug!(bytes = len, "serving download");
    Ok((
        [(CONTENT_TYPE, OCTET_STREAM), (CACHE_CONTROL, "no-store")],
        Bytes::from(buffer),
    ))
}

/// Logs what a download stream delivered once hyper drops it.
struct StreamReport {
    sent: u64,
    started: Instant,
    open: Arc<AtomicUsize>,
}

impl StreamReport {
    fn new(open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self {
            sent: 0,
            started: Instant::now(),
            open,
        }
    }
}

impl Drop for StreamReport {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(
            bytes = self.sent,
            secs = self.started.elapsed().as_secs_f64(),
            "download stream closed"
        );
    }
}

/// Unbounded chunked download. The body is only pulled when the socket can
/// take more data and stops as soon as the client goes away.
pub(super) async fn download_stream(State(state): State<AppState>) -> impl IntoResponse {
    let chunk = state.stream_chunk.clone();
    let shutdown = state.shutdown.clone();
    let mut report = StreamReport::new(state.open_streams.clone());
    let body = futures::stream::poll_fn(move |_| {
        if *shutdown.borrow() {
            return Poll::Ready(None);
        }
        report.sent += chunk.len() as u64;
        Poll::Ready(Some(Ok::<_, Infallible>(chunk.clone())))
    });
    (
        [
            (CONTENT_TYPE, OCTET_STREAM),
            (CONTENT_ENCODING, "identity"),
            (CACHE_CONTROL, "no-store"),
        ],
        Body::from_stream(body),
    )
}

#[derive(Debug, Serialize)]
pub(super) struct UploadResponse {
    received: u64,
}

/// Upload sink: counts the body frame by frame without keeping it.
pub(super) async fn upload(
    State(state): State<AppState>,
    body: Body,
) -> Result<Json<UploadResponse>, ServerError> {
    let limit = state.limits.max_upload_bytes;
    let mut frames = body.into_data_stream();
    let mut received = 0u64;
    while let Some(frame) = frames.next().await {
        received += frame?.len() as u64;
        if received > limit {
            return Err(ServerError::PayloadTooLarge { limit });
        }
    }
    tracing::debug!(received, "upload received");
    Ok(Json(UploadResponse { received }))
}

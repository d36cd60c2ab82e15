use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use super::TransferError;

/// Response body of the streaming download endpoint.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// Pull-driven request body: the transport polls it whenever it can write.
pub type UploadBody = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Body of an upload request.
pub enum UploadPayload {
    /// One long request fed by a producer until the phase deadline.
    Streaming(UploadBody),
    /// One discrete, fully materialized chunk.
    Chunk(Bytes),
}

impl std::fmt::Debug for UploadPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadPayload::Streaming(_) => f.write_str("Streaming(..)"),
            UploadPayload::Chunk(chunk) => write!(f, "Chunk({} bytes)", chunk.len()),
        }
    }
}

/// What the upload sink acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Byte count reported by the server, `None` when the response could not
    /// be parsed.
    pub received: Option<u64>,
}

/// Client side of the speed test endpoints.
///
/// The measurement engine only talks to the server through this trait, which
/// lets tests substitute scripted transports for the HTTP one.
pub trait SpeedTestTransport: Send + Sync + 'static {
    /// One minimal round trip against the echo endpoint.
    fn ping(&self) -> BoxFuture<'_, Result<(), TransferError>>;

    /// Opens the unbounded download stream.
    fn download_stream(&self) -> BoxFuture<'_, Result<ByteStream, TransferError>>;

    /// Posts a body to the upload sink and returns the server's receipt.
    fn upload(
        &self,
        payload: UploadPayload,
    ) -> BoxFuture<'_, Result<UploadReceipt, TransferError>>;

    /// Whether [`UploadPayload::Streaming`] bodies can be sent at all. Fixed for
    /// the lifetime of the transport.
    fn supports_streaming_upload(&self) -> bool;
}

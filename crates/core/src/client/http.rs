use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, Client, RequestBuilder, Response, Url};
use serde::Deserialize;

use crate::measurement::{
    ByteStream, SpeedTestTransport, TransferError, UploadPayload, UploadReceipt,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct UploadAck {
    received: u64,
}

/// [`SpeedTestTransport`] talking HTTP/1.1 to a `lanspeed serve` instance.
///
/// Requests carry no overall timeout: throughput phases bound them with their
/// own deadline and pings are bounded by the caller.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base: Url,
    streaming_upload: bool,
}

impl HttpTransport {
    pub fn new(base: Url) -> Result<Self, TransferError> {
        let client = Client::builder()
            .user_agent(concat!("lanspeed/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base,
            streaming_upload: true,
        })
    }

    /// Advertise (or not) support for streaming request bodies.
    pub fn with_streaming_upload(mut self, enabled: bool) -> Self {
        self.streaming_upload = enabled;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransferError> {
        self.base
            .join(path)
            .map_err(|error| TransferError::other(format!("invalid endpoint {path}: {error}")))
    }

    async fn send(request: RequestBuilder, url: &Url) -> Result<Response, TransferError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

impl SpeedTestTransport for HttpTransport {
    fn ping(&self) -> BoxFuture<'_, Result<(), TransferError>> {
        async move {
            let url = self.endpoint("/ping")?;
            let response = Self::send(self.client.get(url.clone()), &url).await?;
            response.bytes().await?;
            Ok(())
        }
        .boxed()
    }

    fn download_stream(&self) -> BoxFuture<'_, Result<ByteStream, TransferError>> {
        async move {
            let url = self.endpoint("/download-stream")?;
            let response = Self::send(self.client.get(url.clone()), &url).await?;
            Ok(response.bytes_stream().map_err(TransferError::from).boxed())
        }
        .boxed()
    }

    fn upload(
        &self,
        payload: UploadPayload,
    ) -> BoxFuture<'_, Result<UploadReceipt, TransferError>> {
        async move {
            let url = self.endpoint("/upload")?;
            let body = match payload {
                UploadPayload::Streaming(stream) => Body::wrap_stream(stream),
                UploadPayload::Chunk(chunk) => Body::from(chunk),
            };
            let request = self
                .client
                .post(url.clone())
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(body);
            let response = Self::send(request, &url).await?;
            let raw = response.bytes().await?;
            let received = match serde_json::from_slice::<UploadAck>(&raw) {
                Ok(ack) => Some(ack.received),
                Err(error) => {
                    tracing::debug!(%error, "unparsable upload receipt");
                    None
                }
            };
            Ok(UploadReceipt { received })
        }
        .boxed()
    }

    fn supports_streaming_upload(&self) -> bool {
        self.streaming_upload
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use httptest::matchers::request;
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use testresult::TestResult;

    use super::*;

    fn transport(server: &Server) -> TestResult<HttpTransport> {
        Ok(HttpTransport::new(Url::parse(&server.url_str("/"))?)?)
    }

    #[tokio::test]
    async fn ping_round_trip() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/ping"))
                .respond_with(json_encoded(serde_json::json!({ "t": 1_700_000_000_000u64 }))),
        );
        transport(&server)?.ping().await?;
        Ok(())
    }

    #[tokio::test]
    async fn error_status_is_reported() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/ping"))
                .respond_with(status_code(500)),
        );
        let error = transport(&server)?.ping().await.err();
        assert!(matches!(error, Some(TransferError::Status { status: 500, .. })));
        Ok(())
    }

    #[tokio::test]
    async fn download_stream_yields_body() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/download-stream"))
                .respond_with(status_code(200).body(vec![b'a'; 64 * 1024])),
        );
        let mut stream = transport(&server)?.download_stream().await?;
        let mut total = 0;
        while let Some(chunk) = stream.next().await {
            total += chunk?.len();
        }
        assert_eq!(total, 64 * 1024);
        Ok(())
    }

    #[tokio::test]
    async fn chunk_upload_reads_receipt() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/upload"))
                .respond_with(json_encoded(serde_json::json!({ "received": 4096 }))),
        );
        let receipt = transport(&server)?
            .upload(UploadPayload::Chunk(Bytes::from(vec![0u8; 4096])))
            .await?;
        assert_eq!(receipt.received, Some(4096));
        Ok(())
    }

    #[tokio::test]
    async fn streaming_upload_sends_whole_body() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/upload"))
                .respond_with(json_encoded(serde_json::json!({ "received": 3072 }))),
        );
        let chunks = (0..3).map(|_| Ok::<_, std::io::Error>(Bytes::from(vec![0u8; 1024])));
        let body = futures::stream::iter(chunks).boxed();
        let receipt = transport(&server)?
            .upload(UploadPayload::Streaming(body))
            .await?;
        assert_eq!(receipt.received, Some(3072));
        Ok(())
    }

    #[tokio::test]
    async fn garbage_receipt_is_unparsed() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/upload"))
                .respond_with(status_code(200).body("ok")),
        );
        let receipt = transport(&server)?
            .upload(UploadPayload::Chunk(Bytes::from_static(b"abc")))
            .await?;
        assert_eq!(receipt.received, None);
        Ok(())
    }

    #[test]
    fn streaming_capability_is_configurable() -> TestResult {
        let transport = HttpTransport::new(Url::parse("http://192.0.2.1:3000")?)?;
        assert!(transport.supports_streaming_upload());
        assert!(!transport.with_streaming_upload(false).supports_streaming_upload());
        Ok(())
    }
}

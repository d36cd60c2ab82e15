use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};

use super::pool::PhaseSettings;
use super::transport::SpeedTestTransport;
use super::{
    ConnectionContext, ConnectionOutcome, ConnectionPool, ProgressObserver, Role,
    TransferResult, TransferStrategy,
};

/// Drains the server's unbounded download stream on each connection.
pub struct DownloadStrategy<T> {
    transport: Arc<T>,
}

impl<T: SpeedTestTransport> DownloadStrategy<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    async fn drain(&self, conn: ConnectionContext) -> ConnectionOutcome {
        let deadline = tokio::time::sleep_until(conn.deadline);
        tokio::pin!(deadline);

        let mut stream = tokio::select! {
            biased;
            _ = &mut deadline => return ConnectionOutcome::aborted(0),
            opened = self.transport.download_stream() => match opened {
                Ok(stream) => stream,
                Err(error) => {
                    conn.report_error("opening download stream", &error);
                    return ConnectionOutcome::errored(0);
                }
            },
        };

        let mut bytes = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = &mut deadline => {
                    // dropping the stream releases the connection
                    return ConnectionOutcome::aborted(bytes);
                }
                next = stream.next() => match next {
                    Some(Ok(chunk)) => {
                        let len = chunk.len() as u64;
                        if len > 0 {
                            bytes += len;
                            conn.session.record_bytes(len);
                        }
                    }
                    Some(Err(error)) => {
                        conn.report_error("download read", &error);
                        return ConnectionOutcome::errored(bytes);
                    }
                    None => {
                        tracing::debug!(conn = conn.id, bytes, "download stream ended early");
                        return ConnectionOutcome::completed(bytes);
                    }
                },
            }
        }
    }
}

impl<T: SpeedTestTransport> TransferStrategy for DownloadStrategy<T> {
    fn run_connection(&self, conn: ConnectionContext) -> BoxFuture<'_, ConnectionOutcome> {
        self.drain(conn).boxed()
    }
}

/// Runs a complete download phase against `transport`.
pub async fn measure_download<T: SpeedTestTransport>(
    transport: Arc<T>,
    settings: PhaseSettings,
    observer: Arc<dyn ProgressObserver>,
) -> TransferResult {
    tracing::info!(
        connections = settings.connections,
        duration_ms = settings.duration.as_millis() as u64,
        "starting download phase"
    );
    observer.on_log(&format!(
        "download test: {:.1}s ({} connections)",
        settings.duration.as_secs_f64(),
        settings.connections
    ));
    let session = settings.new_session(Role::Download, observer);
    ConnectionPool::new(DownloadStrategy::new(transport))
        .run(settings.connections, settings.duration, session)
        .await
}

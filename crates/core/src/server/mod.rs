//! HTTP side of the speed test: the endpoints a measurement client talks to.
//!
//! | endpoint                | purpose                                   |
//! |-------------------------|-------------------------------------------|
//! | `GET /ping`             | minimal round trip, `{ "t": <epoch ms> }` |
//! | `GET /download?size=N`  | one-shot body of `N` bytes                |
//! | `GET /download-stream`  | unbounded chunked body                    |
//! | `POST /upload`          | sink answering `{ "received": <bytes> }`  |

pub(crate) mod errors;
mod path_handlers;

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;

pub use errors::ServerError;

/// How long in-flight responses get to finish once shutdown was requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_upload_bytes: u64,
    max_download_bytes: u64,
}

#[derive(Clone)]
struct AppState {
    limits: Arc<Limits>,
    stream_chunk: Bytes,
    shutdown: watch::Receiver<bool>,
    /// Download streams whose body has not been dropped yet.
    open_streams: Arc<AtomicUsize>,
}

fn router(
    config: &ServerConfig,
    shutdown: watch::Receiver<bool>,
    open_streams: Arc<AtomicUsize>,
) -> Router {
    let state = AppState {
        limits: Arc::new(Limits {
            max_upload_bytes: config.max_upload_bytes,
            max_download_bytes: config.max_download_bytes,
        }),
        stream_chunk: Bytes::from(vec![b'a'; config.download_chunk_size]),
        shutdown,
        open_streams,
    };
    Router::new()
        .route("/ping", get(path_handlers::ping))
        .route("/download", get(path_handlers::download))
        .route("/download-stream", get(path_handlers::download_stream))
        .route("/upload", post(path_handlers::upload))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A server running in the background.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    open_streams: Arc<AtomicUsize>,
    task: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Download streams currently being served.
    pub fn open_download_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    /// Runs until `signal` resolves, then shuts down.
    pub async fn run_until(mut self, signal: impl Future<Output = ()>) -> io::Result<()> {
        tokio::select! {
            joined = &mut self.task => return flatten(joined),
            _ = signal => {}
        }
        self.shutdown().await
    }

    /// Stops accepting connections and ends open download streams. Responses
    /// still in flight after [`SHUTDOWN_GRACE`] are dropped.
    pub async fn shutdown(self) -> io::Result<()> {
        tracing::info!("shutting down");
        self.shutdown.send_replace(true);
        let mut task = self.task;
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                tracing::warn!("connections still open after grace period, closing them");
                task.abort();
                Ok(())
            }
        }
    }
}

fn flatten(joined: Result<io::Result<()>, tokio::task::JoinError>) -> io::Result<()> {
    match joined {
        Ok(result) => result,
        Err(error) => Err(io::Error::other(error)),
    }
}

/// Binds the configured address and starts serving in the background.
pub async fn start(config: &ServerConfig) -> io::Result<ServerHandle> {
    let listener = TcpListener::bind((config.address, config.port)).await?;
    let local_addr = listener.local_addr()?;
    let (shutdown, mut signal) = watch::channel(false);
    let open_streams = Arc::new(AtomicUsize::new(0));
    let app = router(config, signal.clone(), open_streams.clone());

    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = signal.wait_for(|stop| *stop).await;
            })
            .await
    });
    tracing::debug!(%local_addr, "listening");

    Ok(ServerHandle {
        local_addr,
        shutdown,
        open_streams,
        task,
    })
}

/// Startup banner with the URLs clients can use.
pub fn banner(port: u16, lan: Option<IpAddr>) -> String {
    let network = lan.map_or_else(|| "localhost".to_owned(), |ip| ip.to_string());
    format!(
        "lanspeed server\n  Local:   http://localhost:{port}\n  Network: http://{network}:{port}"
    )
}

/// Serves until Ctrl-C.
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let handle = start(&config).await?;
    let port = handle.local_addr().port();
    let lan = crate::util::lan_address();
    tracing::info!(
        port,
        lan = ?lan,
        max_upload_bytes = config.max_upload_bytes,
        max_download_bytes = config.max_download_bytes,
        "server started"
    );
    println!("{}", banner(port, lan));

    handle
        .run_until(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

//! Client side of the speed test protocol.

use reqwest::Url;

use crate::runner::RunError;
use crate::util::is_local_target;

mod http;

pub use http::HttpTransport;

/// Refuses targets that resolve to this machine: measuring against ourselves
/// only exercises the loopback interface.
pub async fn ensure_remote_target(server: &Url) -> Result<(), RunError> {
    let host = server.host_str().ok_or_else(|| RunError::InvalidServer {
        url: server.to_string(),
        reason: "missing host".into(),
    })?;
    let port = server.port_or_known_default().unwrap_or(80);
    if is_local_target(host, port).await {
        tracing::warn!(%host, "target resolves to this machine");
        return Err(RunError::LoopbackTarget {
            host: host.to_owned(),
        });
    }
    Ok(())
}

use thiserror::Error;

/// Failure of a single request or connection.
///
/// These never abort a phase: the connection that hit it stops, whatever it
/// moved so far is kept and the error is logged.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("no answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("stream closed unexpectedly")]
    Closed,

    #[error("transport error: {0}")]
    Other(String),
}

impl TransferError {
    pub fn other(cause: impl Into<String>) -> Self {
        TransferError::Other(cause.into())
    }
}

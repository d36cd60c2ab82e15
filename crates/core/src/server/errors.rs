use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Failure of a speed test endpoint, rendered as `{ "error": "..." }`.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot allocate a buffer of {requested} bytes (limit {limit})")]
    Allocation { requested: u64, limit: u64 },

    #[error("upload exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("failed reading request body: {0}")]
    Body(#[from] axum::Error),
}

impl ServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::Allocation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::Body(_) => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::warn!(%status, error = %self, "request failed");
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

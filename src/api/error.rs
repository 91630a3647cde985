use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use super::types::ErrorResponse;

/// Everything `/message` can fail with. Client errors carry a fixed message
/// and never echo the input; internal causes are logged, not returned.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Message cannot be empty")]
    EmptyMessage,
    #[error("Message must be a string")]
    InvalidMessage,
    #[error("Message is too long")]
    MessageTooLong,
    #[error("An unexpected error occurred")]
    Internal(#[source] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::EmptyMessage | ApiError::InvalidMessage | ApiError::MessageTooLong => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(err) = &self {
            error!("message handler failed: {err:#}");
        }
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

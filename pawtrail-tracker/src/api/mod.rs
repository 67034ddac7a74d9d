//! Local read-only status API

pub mod health;
pub mod sse;
pub mod walks;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::{ErrorKind, TrackerError};

pub use health::health_routes;
pub use sse::event_stream;
pub use walks::{get_walk, list_walks};

/// Handler error: a tracker error rendered as JSON
#[derive(Debug)]
pub struct ApiError(pub TrackerError);

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidTransition => StatusCode::CONFLICT,
            ErrorKind::PreconditionFailed => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::LocationUnavailable | ErrorKind::PermanentFailure => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::BufferFull => StatusCode::INSUFFICIENT_STORAGE,
        };

        let body = Json(json!({
            "error": {
                "code": kind,
                "message": self.0.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

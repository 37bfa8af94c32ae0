//! Errors surfaced at the HTTP boundary.
//!
//! Each variant maps to a status code and a small JSON body of the shape
//! `{"error": "..."}`. Errors raised inside background loops never reach
//! this type; they are logged at the loop boundary and the loop continues.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RouterError {
    #[error("no healthy upstream")]
    NoHealthyUpstream,

    #[error("model {0} not available")]
    ModelNotAvailable(String),

    /// All retries exhausted (or the single at-capacity attempt failed).
    /// Carries a summary of the last upstream error.
    #[error("{0}")]
    UpstreamUnavailable(String),

    #[error("could not read request body")]
    BadRequestBody,

    #[error("internal server error")]
    Internal,
}

impl RouterError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouterError::NoHealthyUpstream => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::ModelNotAvailable(_) => StatusCode::NOT_FOUND,
            RouterError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            RouterError::BadRequestBody => StatusCode::BAD_REQUEST,
            RouterError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

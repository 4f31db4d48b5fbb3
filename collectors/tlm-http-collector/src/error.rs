use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tlm_core::{codec::ParseError, Overloaded};

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error, {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned to HTTP clients.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("malformed event, {0}")]
    Parse(#[from] ParseError),
    #[error("overloaded, {source}")]
    Overloaded {
        source: Overloaded,
        accepted: Vec<u64>,
        total: usize,
        retry_after_secs: u64,
    },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Parse(e) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "status": "rejected",
                    "reason": "parse",
                    "error": e.to_string(),
                })),
            )
                .into_response(),
            ApiError::Overloaded {
                source,
                accepted,
                total,
                retry_after_secs,
            } => (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                Json(json!({
                    "status": "rejected",
                    "reason": "overloaded",
                    "error": source.to_string(),
                    "accepted": accepted.len(),
                    "total": total,
                    "ids": accepted,
                })),
            )
                .into_response(),
        }
    }
}

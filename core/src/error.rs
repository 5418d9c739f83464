//! Error kinds shared by every service's HTTP layer.
//!
//! Propagation policy (spec.md §7): components recover locally where they
//! can (retries, fallbacks); once an error crosses the HTTP boundary it is
//! rendered as `{"error": "<message>"}` with the status below. Nothing here
//! panics on a malformed request.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient_cash: {0}")]
    InsufficientCash(String),

    #[error("insufficient_position: {0}")]
    InsufficientPosition(String),

    #[error("market_quote_missing: {0}")]
    MarketQuoteMissing(String),

    #[error("store_unreachable: {0}")]
    StoreUnreachable(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_)
            | AppError::InsufficientCash(_)
            | AppError::InsufficientPosition(_)
            | AppError::MarketQuoteMissing(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::StoreUnreachable(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Internal(format!("sqlite: {e}"))
    }
}

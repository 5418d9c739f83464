//! The header contract shared by every service (spec.md §6).

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};

use crate::clock::parse_iso_utc;
use crate::error::AppError;

pub const HEADER_SIM_TIME: &str = "x-simulation-time";
pub const HEADER_WEBHOOK_TOKEN: &str = "x-webhook-token";
pub const HEADER_API_KEY: &str = "x-api-key";

/// Extract and parse `X-Simulation-Time` if present. Per spec.md §6, a
/// present-but-unparsable value rejects the request rather than being
/// ignored.
pub fn parse_sim_time_header(headers: &HeaderMap) -> Result<Option<DateTime<Utc>>, AppError> {
    match headers.get(HEADER_SIM_TIME) {
        None => Ok(None),
        Some(v) => {
            let s = v
                .to_str()
                .map_err(|_| AppError::BadRequest("invalid X-Simulation-Time encoding".into()))?;
            Ok(Some(parse_iso_utc(s)?))
        }
    }
}

/// Server-to-server auth: when `configured` is empty the header is ignored
/// (auth disabled); otherwise the header value must match exactly.
pub fn check_token(configured: &Option<String>, header_name: &str, headers: &HeaderMap) -> bool {
    match configured {
        None => true,
        Some(expected) if expected.is_empty() => true,
        Some(expected) => headers
            .get(header_name)
            .and_then(|v| v.to_str().ok())
            .map(|got| got == expected)
            .unwrap_or(false),
    }
}

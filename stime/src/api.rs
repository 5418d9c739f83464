//! Stime HTTP surface (spec.md §6.4).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use quant_core::{AppError, Clock};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::driver::{AdvanceAndTickRequest, AdvanceUnit, SimDriver};

pub struct AppState {
    pub clock: Clock,
    pub driver: Arc<SimDriver>,
    pub config: RwLock<Config>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/now", get(now))
        .route("/set", post(set))
        .route("/advance", post(advance))
        .route("/advance-and-tick", post(advance_and_tick))
        .route("/advance-and-tick/status", get(advance_and_tick_status))
        .route("/advance-and-tick/cancel", post(advance_and_tick_cancel))
        .route("/config", get(get_config).post(post_config))
        .with_state(state)
}

async fn now(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "now": state.clock.now() }))
}

#[derive(Debug, Deserialize)]
struct SetRequest {
    now: String,
}

async fn set(State(state): State<Arc<AppState>>, Json(req): Json<SetRequest>) -> Result<Json<Value>, AppError> {
    let t = state.clock.set_iso(&req.now)?;
    Ok(Json(json!({ "now": t })))
}

#[derive(Debug, Deserialize, Default)]
struct AdvanceRequest {
    days: Option<i64>,
    hours: Option<i64>,
    minutes: Option<i64>,
    seconds: Option<i64>,
}

/// Exactly one unit field, value `>= 1` (spec.md §8 "Stime `advance` with
/// zero units are rejected (400)").
async fn advance(State(state): State<Arc<AppState>>, Json(req): Json<AdvanceRequest>) -> Result<Json<Value>, AppError> {
    let provided: Vec<(AdvanceUnit, i64)> = [
        (AdvanceUnit::Days, req.days),
        (AdvanceUnit::Hours, req.hours),
        (AdvanceUnit::Minutes, req.minutes),
        (AdvanceUnit::Seconds, req.seconds),
    ]
    .into_iter()
    .filter_map(|(u, v)| v.map(|v| (u, v)))
    .collect();

    if provided.len() != 1 {
        return Err(AppError::BadRequest("advance requires exactly one of days|hours|minutes|seconds".into()));
    }
    let (unit, value) = provided[0];
    if value < 1 {
        return Err(AppError::BadRequest("advance value must be >= 1".into()));
    }
    let t = state.clock.advance(unit.duration(value))?;
    Ok(Json(json!({ "now": t })))
}

#[derive(Debug, Deserialize, Default)]
struct AdvanceAndTickRequestBody {
    days: Option<i64>,
    hours: Option<i64>,
    minutes: Option<i64>,
    seconds: Option<i64>,
    steps: u32,
    #[serde(default)]
    snap_to_boundary: bool,
    tick_urls: Option<Vec<String>>,
    timeout_secs: Option<u64>,
}

/// `202 {status:"started", steps}`; `409` if a job is already running
/// (spec.md §6.4). `steps=1` with a zero-valued step unit is rejected.
async fn advance_and_tick(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AdvanceAndTickRequestBody>,
) -> Result<(axum::http::StatusCode, Json<Value>), AppError> {
    let provided: Vec<(AdvanceUnit, i64)> = [
        (AdvanceUnit::Days, req.days),
        (AdvanceUnit::Hours, req.hours),
        (AdvanceUnit::Minutes, req.minutes),
        (AdvanceUnit::Seconds, req.seconds),
    ]
    .into_iter()
    .filter_map(|(u, v)| v.map(|v| (u, v)))
    .collect();
    if provided.len() != 1 {
        return Err(AppError::BadRequest("advance-and-tick requires exactly one of days|hours|minutes|seconds".into()));
    }
    let (unit, step_value) = provided[0];
    if step_value < 1 || req.steps < 1 {
        return Err(AppError::BadRequest("advance-and-tick requires step value >= 1 and steps >= 1".into()));
    }

    let config = state.config.read().clone();
    let tick_urls = req.tick_urls.unwrap_or(config.tick_urls);
    let timeout = req.timeout_secs.map(StdDuration::from_secs).unwrap_or(config.zuilow_tick_timeout);

    let steps = state.driver.start(AdvanceAndTickRequest {
        unit,
        step_value,
        steps: req.steps,
        tick_urls,
        timeout,
        snap_to_boundary: req.snap_to_boundary,
        webhook_token: config.webhook_token,
    })?;

    Ok((axum::http::StatusCode::ACCEPTED, Json(json!({ "status": "started", "steps": steps }))))
}

async fn advance_and_tick_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.driver.status()))
}

async fn advance_and_tick_cancel(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.driver.cancel();
    Json(json!({ "status": "cancel_requested" }))
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.config.read();
    Json(json!({
        "tick_urls": config.tick_urls,
        "zuilow_tick_timeout": config.zuilow_tick_timeout.as_secs(),
    }))
}

#[derive(Debug, Deserialize)]
struct ConfigUpdate {
    tick_urls: Option<Vec<String>>,
    zuilow_tick_timeout: Option<u64>,
}

async fn post_config(State(state): State<Arc<AppState>>, Json(req): Json<ConfigUpdate>) -> Json<Value> {
    let mut config = state.config.write();
    if let Some(urls) = req.tick_urls {
        config.tick_urls = urls;
    }
    if let Some(secs) = req.zuilow_tick_timeout {
        config.zuilow_tick_timeout = StdDuration::from_secs(secs);
    }
    Json(json!({
        "tick_urls": config.tick_urls,
        "zuilow_tick_timeout": config.zuilow_tick_timeout.as_secs(),
    }))
}


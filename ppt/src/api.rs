//! PPT HTTP surface (spec.md §6.2, prefix `/api`).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use quant_core::http::check_token;
use quant_core::{AppError, Clock, Fetcher};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::paperbook::{PaperBook, Side};
use crate::store::PptStore;

pub struct AppState {
    pub store: Arc<PptStore>,
    pub book: Arc<PaperBook>,
    pub fetcher: Arc<dyn Fetcher>,
    pub clock: Clock,
    pub config: Config,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/webhook", post(webhook))
        .route("/api/orders", post(place_order).get(list_orders))
        .route("/api/account", get(account_summary))
        .route("/api/positions", get(list_positions))
        .route("/api/trades", get(list_trades))
        .route("/api/equity", get(list_equity))
        .route("/api/equity/update", post(update_equity))
        .route("/api/export/:kind", get(export_csv))
        .route("/api/accounts", get(list_accounts).post(create_account))
        .route("/api/accounts/switch", post(switch_account))
        .route("/api/accounts/:name", delete(delete_account))
        .route("/api/account/deposit", post(deposit))
        .route("/api/account/withdraw", post(withdraw))
        .route("/api/account/reset", post(reset_account))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct OrderRequest {
    symbol: String,
    #[serde(alias = "action")]
    side: String,
    #[serde(alias = "contracts")]
    qty: f64,
    price: f64,
    account: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    token: Option<String>,
}

async fn resolve_price(state: &AppState, symbol: &str, price: f64) -> Result<f64, AppError> {
    if price > 0.0 {
        return Ok(price);
    }
    let quote = state.fetcher.quote(symbol).await?;
    Ok(quote.price)
}

async fn place_order_common(
    state: &AppState,
    headers: &HeaderMap,
    req: OrderRequest,
    source: &str,
) -> Result<Value, AppError> {
    let side = Side::from_alias(&req.side)
        .ok_or_else(|| AppError::BadRequest(format!("unknown side '{}'", req.side)))?;
    let account = req.account.unwrap_or_else(|| state.config.default_account.clone());
    let at = quant_core::http::parse_sim_time_header(headers)?.unwrap_or_else(|| state.clock.now());
    let resolved_price = resolve_price(state, &req.symbol, req.price).await?;

    let outcome = state.book.place_order(
        &account,
        &req.symbol,
        side,
        req.qty,
        resolved_price,
        source,
        at,
        state.clock.is_sim_mode(),
    )?;

    Ok(json!({
        "status": "ok",
        "order": outcome.order,
        "simulation": {
            "slippage": outcome.slippage_cost,
            "commission": outcome.commission,
            "fill_rate": outcome.fill_rate,
            "total_cost": outcome.total_cost,
        },
        "cash": outcome.cash_after,
    }))
}

async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<OrderRequest>,
) -> Result<Json<Value>, AppError> {
    if !check_token(&state.config.webhook_token, quant_core::http::HEADER_WEBHOOK_TOKEN, &headers) {
        return Err(AppError::Unauthorized);
    }
    Ok(Json(place_order_common(&state, &headers, req, "webhook").await?))
}

async fn place_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<OrderRequest>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(place_order_common(&state, &headers, req, "web").await?))
}

#[derive(Debug, Deserialize, Default)]
struct AccountQuery {
    account: Option<String>,
}

fn account_name(state: &AppState, q: &AccountQuery) -> String {
    q.account.clone().unwrap_or_else(|| state.config.default_account.clone())
}

async fn account_summary(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AccountQuery>,
) -> Result<Json<Value>, AppError> {
    let account = account_name(&state, &q);
    let positions = state.store.list_positions(&account)?;
    let mut market_value = 0.0;
    for pos in &positions {
        let price = state.store.watchlist_price(&account, &pos.symbol)?.unwrap_or(pos.avg_price);
        market_value += pos.qty * price;
    }
    Ok(Json(state.book.account_summary(&account, &positions, market_value)?))
}

async fn list_positions(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AccountQuery>,
) -> Result<Json<Value>, AppError> {
    let account = account_name(&state, &q);
    let positions = state.store.list_positions(&account)?;
    Ok(Json(json!({ "positions": positions })))
}

#[derive(Debug, Deserialize, Default)]
struct HistoryQuery {
    account: Option<String>,
    limit: Option<i64>,
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Value>, AppError> {
    let account = q.account.unwrap_or_else(|| state.config.default_account.clone());
    let orders = state.store.list_orders(&account, q.limit.unwrap_or(100))?;
    Ok(Json(json!({ "orders": orders })))
}

async fn list_trades(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Value>, AppError> {
    let account = q.account.unwrap_or_else(|| state.config.default_account.clone());
    let trades = state.store.list_trades(&account, q.limit.unwrap_or(100))?;
    Ok(Json(json!({ "trades": trades })))
}

async fn list_equity(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AccountQuery>,
) -> Result<Json<Value>, AppError> {
    let account = account_name(&state, &q);
    let points = state.store.list_equity(&account)?;
    Ok(Json(json!({ "equity": points })))
}

async fn update_equity(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AccountQuery>,
) -> Result<Json<Value>, AppError> {
    let account = account_name(&state, &q);
    let positions = state.store.list_positions(&account)?;
    let fetcher = state.fetcher.clone();
    let mut quotes = std::collections::HashMap::new();
    for pos in &positions {
        if let Ok(q) = fetcher.quote(&pos.symbol).await {
            quotes.insert(pos.symbol.clone(), q.price);
        }
    }
    let today = state.clock.today();
    let point = state.book.recompute_equity(&account, today, |sym| quotes.get(sym).copied())?;
    Ok(Json(json!({ "status": "ok", "equity": point })))
}

async fn export_csv(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(q): Query<AccountQuery>,
) -> Result<Response, AppError> {
    let account = account_name(&state, &q);
    let body = match kind.as_str() {
        "trades" => {
            let mut out = String::from("time,symbol,side,qty,price,value\n");
            for t in state.store.list_trades(&account, i64::MAX)? {
                out.push_str(&format!(
                    "{},{},{},{},{},{}\n",
                    t.time.to_rfc3339(), t.symbol, t.side, t.qty, t.price, t.qty * t.price
                ));
            }
            out
        }
        "equity" => {
            let mut out = String::from("date,equity,pnl,pnl_pct\n");
            for e in state.store.list_equity(&account)? {
                out.push_str(&format!("{},{},{},{}\n", e.date, e.equity, e.pnl, e.pnl_pct));
            }
            out
        }
        other => return Err(AppError::BadRequest(format!("unknown export kind '{other}'"))),
    };
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/csv")
        .body(Body::from(body))
        .map_err(|e| AppError::Internal(e.to_string()))
}

async fn list_accounts(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let accounts = state.store.list_accounts()?;
    let current = state.store.current_account()?;
    Ok(Json(json!({ "accounts": accounts, "current": current })))
}

#[derive(Debug, Deserialize)]
struct CreateAccountRequest {
    name: String,
    initial_capital: Option<f64>,
}

async fn create_account(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateAccountRequest>,
) -> Result<Json<Value>, AppError> {
    let capital = req.initial_capital.unwrap_or(state.config.default_initial_capital);
    state.store.create_account(&req.name, capital, state.clock.now())?;
    Ok(Json(json!({ "status": "created", "name": req.name })))
}

#[derive(Debug, Deserialize)]
struct SwitchAccountRequest {
    name: String,
}

async fn switch_account(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SwitchAccountRequest>,
) -> Result<Json<Value>, AppError> {
    state
        .store
        .get_account(&req.name)?
        .ok_or_else(|| AppError::NotFound(format!("account '{}'", req.name)))?;
    state.store.set_current_account(&req.name)?;
    Ok(Json(json!({ "status": "ok", "current": req.name })))
}

/// Deleting the last remaining account is rejected (spec.md §4.4 account
/// lifecycle invariant: at least one account always exists).
async fn delete_account(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    let accounts = state.store.list_accounts()?;
    if accounts.len() <= 1 {
        return Err(AppError::Conflict("cannot delete the last remaining account".into()));
    }
    state.store.delete_account(&name)?;
    if state.store.current_account()?.as_deref() == Some(name.as_str()) {
        if let Some(other) = accounts.iter().find(|a| a.name != name) {
            state.store.set_current_account(&other.name)?;
        }
    }
    Ok(Json(json!({ "status": "deleted", "name": name })))
}

#[derive(Debug, Deserialize)]
struct CashRequest {
    account: Option<String>,
    amount: f64,
}

async fn deposit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CashRequest>,
) -> Result<Json<Value>, AppError> {
    apply_cash_delta(&state, req, 1.0).await
}

async fn withdraw(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CashRequest>,
) -> Result<Json<Value>, AppError> {
    apply_cash_delta(&state, req, -1.0).await
}

async fn apply_cash_delta(state: &AppState, req: CashRequest, sign: f64) -> Result<Json<Value>, AppError> {
    let account = req.account.unwrap_or_else(|| state.config.default_account.clone());
    let acct = state
        .store
        .get_account(&account)?
        .ok_or_else(|| AppError::NotFound(format!("account '{account}'")))?;
    let new_cash = acct.cash + sign * req.amount;
    if new_cash < 0.0 {
        return Err(AppError::InsufficientCash(format!("withdrawal of {} exceeds cash {}", req.amount, acct.cash)));
    }
    state.store.set_cash(&account, new_cash)?;
    Ok(Json(json!({ "status": "ok", "cash": new_cash })))
}

#[derive(Debug, Deserialize, Default)]
struct ResetRequest {
    account: Option<String>,
    initial_capital: Option<f64>,
}

async fn reset_account(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ResetRequest>>,
) -> Result<Json<Value>, AppError> {
    let req = body.map(|b| b.0).unwrap_or_default();
    let account = req.account.unwrap_or_else(|| state.config.default_account.clone());
    state.store.reset_account(&account, req.initial_capital)?;
    Ok(Json(json!({ "status": "reset", "account": account })))
}

//! BrokerGateway (spec.md §4.9, C11): a uniform trait over the paper engine
//! and real brokers. Futu/IBKR wire protocols are external collaborators
//! (spec.md §1) — these gateways prove the routing contract (connect,
//! account/position/order surface) without speaking the real protocols.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quant_core::http::{HEADER_SIM_TIME, HEADER_WEBHOOK_TOKEN};
use quant_core::{AppError, Fetcher, Interval, Quote};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub cash: f64,
    pub total_assets: f64,
    pub market_value: f64,
    pub power: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: f64,
    pub avg_price: f64,
    pub current_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub price: Option<f64>,
    pub status: String,
}

#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn connect(&self) -> Result<(), AppError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;

    async fn get_quote(&self, symbol: &str) -> Result<Quote, AppError>;
    async fn get_history(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
    ) -> Result<Vec<quant_core::Bar>, AppError>;
    async fn get_account(&self, account: Option<&str>) -> Result<AccountInfo, AppError>;
    async fn get_positions(&self, account: Option<&str>) -> Result<Vec<BrokerPosition>, AppError>;
    async fn get_orders(&self, account: Option<&str>) -> Result<Vec<BrokerOrder>, AppError>;
    async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        qty: f64,
        price: Option<f64>,
        order_type: &str,
        account: Option<&str>,
        sim_time: Option<DateTime<Utc>>,
    ) -> Result<String, AppError>;
    async fn cancel_order(&self, order_id: &str, account: Option<&str>) -> Result<(), AppError>;
}

/// Forwards `place_order` to PPT over the same webhook contract external
/// clients use (spec.md §4.9). Connected only when both the command channel
/// (PPT's HTTP endpoint) and the data channel (the quote/history source)
/// answer; losing either disconnects until `connect()` runs again.
pub struct PaperGateway {
    ppt_url: String,
    webhook_token: Option<String>,
    fetcher: Arc<dyn Fetcher>,
    http: reqwest::Client,
    state: Mutex<(bool, bool)>,
}

impl PaperGateway {
    pub fn new(ppt_url: String, webhook_token: Option<String>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            ppt_url,
            webhook_token,
            fetcher,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            state: Mutex::new((false, false)),
        }
    }
}

#[async_trait]
impl BrokerGateway for PaperGateway {
    async fn connect(&self) -> Result<(), AppError> {
        let command_ok = self
            .http
            .get(format!("{}/api/account", self.ppt_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        let data_ok = self.fetcher.quote("AAPL").await.is_ok();
        *self.state.lock() = (command_ok, data_ok);
        if command_ok && data_ok {
            Ok(())
        } else {
            Err(AppError::StoreUnreachable("paper gateway command/data channel unreachable".into()))
        }
    }

    async fn disconnect(&self) {
        *self.state.lock() = (false, false);
    }

    fn is_connected(&self) -> bool {
        let (cmd, data) = *self.state.lock();
        cmd && data
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, AppError> {
        self.fetcher.quote(symbol).await
    }

    async fn get_history(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
    ) -> Result<Vec<quant_core::Bar>, AppError> {
        self.fetcher.history(symbol, interval, start, end).await
    }

    async fn get_account(&self, account: Option<&str>) -> Result<AccountInfo, AppError> {
        let mut url = format!("{}/api/account", self.ppt_url);
        if let Some(a) = account {
            url.push_str(&format!("?account={a}"));
        }
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::StoreUnreachable(e.to_string()))?;
        let body: serde_json::Value = resp.json().await.map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(AccountInfo {
            cash: body["cash"].as_f64().unwrap_or(0.0),
            total_assets: body["equity"].as_f64().unwrap_or(0.0),
            market_value: body["position_value"].as_f64().unwrap_or(0.0),
            power: body["cash"].as_f64().unwrap_or(0.0),
        })
    }

    async fn get_positions(&self, account: Option<&str>) -> Result<Vec<BrokerPosition>, AppError> {
        let mut url = format!("{}/api/positions", self.ppt_url);
        if let Some(a) = account {
            url.push_str(&format!("?account={a}"));
        }
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::StoreUnreachable(e.to_string()))?;
        let body: serde_json::Value = resp.json().await.map_err(|e| AppError::Internal(e.to_string()))?;
        let positions = body["positions"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| {
                Some(BrokerPosition {
                    symbol: p.get("symbol")?.as_str()?.to_string(),
                    qty: p.get("qty")?.as_f64()?,
                    avg_price: p.get("avg_price")?.as_f64()?,
                    current_price: p.get("current_price").and_then(|v| v.as_f64()),
                })
            })
            .collect();
        Ok(positions)
    }

    async fn get_orders(&self, account: Option<&str>) -> Result<Vec<BrokerOrder>, AppError> {
        let mut url = format!("{}/api/orders", self.ppt_url);
        if let Some(a) = account {
            url.push_str(&format!("?account={a}"));
        }
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::StoreUnreachable(e.to_string()))?;
        let body: serde_json::Value = resp.json().await.map_err(|e| AppError::Internal(e.to_string()))?;
        let orders = body["orders"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|o| {
                Some(BrokerOrder {
                    id: o.get("id")?.as_str()?.to_string(),
                    symbol: o.get("symbol")?.as_str()?.to_string(),
                    side: o.get("side")?.as_str()?.to_string(),
                    qty: o.get("filled_qty")?.as_f64()?,
                    price: o.get("exec_price").and_then(|v| v.as_f64()),
                    status: o.get("status")?.as_str()?.to_string(),
                })
            })
            .collect();
        Ok(orders)
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        qty: f64,
        price: Option<f64>,
        _order_type: &str,
        account: Option<&str>,
        sim_time: Option<DateTime<Utc>>,
    ) -> Result<String, AppError> {
        let mut req = self.http.post(format!("{}/api/webhook", self.ppt_url)).json(&json!({
            "symbol": symbol,
            "side": side,
            "qty": qty,
            "price": price.unwrap_or(0.0),
            "account": account,
        }));
        if let Some(t) = sim_time {
            req = req.header(HEADER_SIM_TIME, t.to_rfc3339());
        }
        if let Some(token) = &self.webhook_token {
            req = req.header(HEADER_WEBHOOK_TOKEN, token.as_str());
        }
        let resp = req.send().await.map_err(|e| AppError::StoreUnreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AppError::Internal(format!("order_submit_failed: {}", resp.status())));
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(body["order"]["id"].as_str().unwrap_or_default().to_string())
    }

    async fn cancel_order(&self, _order_id: &str, _account: Option<&str>) -> Result<(), AppError> {
        // PPT fills synchronously; there is nothing in flight to cancel.
        Ok(())
    }
}

/// Stub gateway for a real broker reachable over HTTP, enough to prove the
/// routing contract (spec.md §4.8 "Routing") without implementing a real
/// wire protocol, which stays out of scope (spec.md §1).
pub struct HttpStubGateway {
    name: &'static str,
    base_url: Option<String>,
    http: reqwest::Client,
    connected: Mutex<bool>,
}

impl HttpStubGateway {
    pub fn new(name: &'static str, base_url: Option<String>) -> Self {
        Self {
            name,
            base_url,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            connected: Mutex::new(false),
        }
    }

    fn require_url(&self) -> Result<&str, AppError> {
        self.base_url
            .as_deref()
            .ok_or_else(|| AppError::StoreUnreachable(format!("{} gateway has no configured URL", self.name)))
    }
}

#[async_trait]
impl BrokerGateway for HttpStubGateway {
    async fn connect(&self) -> Result<(), AppError> {
        let url = self.require_url()?;
        let ok = self.http.get(url).send().await.map(|r| r.status().is_success()).unwrap_or(false);
        *self.connected.lock() = ok;
        if ok {
            Ok(())
        } else {
            Err(AppError::StoreUnreachable(format!("{} gateway unreachable", self.name)))
        }
    }

    async fn disconnect(&self) {
        *self.connected.lock() = false;
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, AppError> {
        let url = self.require_url()?;
        let resp = self.http.get(format!("{url}/quote/{symbol}")).send().await
            .map_err(|e| AppError::StoreUnreachable(e.to_string()))?;
        let body: serde_json::Value = resp.json().await.map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(Quote {
            price: body["price"].as_f64().unwrap_or(0.0),
            as_of: Utc::now(),
        })
    }

    async fn get_history(
        &self,
        _symbol: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _interval: Interval,
    ) -> Result<Vec<quant_core::Bar>, AppError> {
        Err(AppError::Internal(format!("{} history not implemented", self.name)))
    }

    async fn get_account(&self, _account: Option<&str>) -> Result<AccountInfo, AppError> {
        Err(AppError::Internal(format!("{} account lookup not implemented", self.name)))
    }

    async fn get_positions(&self, _account: Option<&str>) -> Result<Vec<BrokerPosition>, AppError> {
        Err(AppError::Internal(format!("{} positions not implemented", self.name)))
    }

    async fn get_orders(&self, _account: Option<&str>) -> Result<Vec<BrokerOrder>, AppError> {
        Err(AppError::Internal(format!("{} orders not implemented", self.name)))
    }

    async fn place_order(
        &self,
        _symbol: &str,
        _side: &str,
        _qty: f64,
        _price: Option<f64>,
        _order_type: &str,
        _account: Option<&str>,
        _sim_time: Option<DateTime<Utc>>,
    ) -> Result<String, AppError> {
        Err(AppError::Internal(format!("{} order routing not implemented", self.name)))
    }

    async fn cancel_order(&self, _order_id: &str, _account: Option<&str>) -> Result<(), AppError> {
        Err(AppError::Internal(format!("{} cancel not implemented", self.name)))
    }
}

//! SignalExecutor (spec.md §4.8, C10): consumes due pending signals, routes
//! them to a broker by account type, and applies rebalance/allocation diff
//! math against live equity and positions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use quant_core::AppError;
use serde::Serialize;
use tracing::{error, warn};

use crate::broker::BrokerGateway;
use crate::config::Config;
use crate::signal_store::SignalStore;
use crate::store::{SignalStatus, TradingSignal};

/// `account type -> gateway`. The executor never guesses (spec.md §4.8
/// "Routing"): an account whose configured type has no registered gateway
/// fails the signal rather than falling back to a default.
pub struct BrokerRegistry {
    gateways: HashMap<String, Arc<dyn BrokerGateway>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self { gateways: HashMap::new() }
    }

    pub fn register(&mut self, broker_type: &str, gateway: Arc<dyn BrokerGateway>) {
        self.gateways.insert(broker_type.to_string(), gateway);
    }

    pub fn get(&self, broker_type: &str) -> Option<Arc<dyn BrokerGateway>> {
        self.gateways.get(broker_type).cloned()
    }
}

impl Default for BrokerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RunOnceOutcome {
    pub pending: usize,
    pub executed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

pub struct SignalExecutor {
    signals: Arc<SignalStore>,
    brokers: Arc<BrokerRegistry>,
    config: Config,
}

impl SignalExecutor {
    pub fn new(signals: Arc<SignalStore>, brokers: Arc<BrokerRegistry>, config: Config) -> Self {
        Self { signals, brokers, config }
    }

    fn broker_for(&self, account: &str) -> Option<Arc<dyn BrokerGateway>> {
        let broker_type = self.config.broker_type_for(account)?;
        self.brokers.get(broker_type)
    }

    /// Runs exactly the given signals through the executor, used by the
    /// scheduler's `send_immediately` path (spec.md §4.7 "Running a job"
    /// step f) to execute a job's own just-inserted rows synchronously.
    pub async fn execute_signals(&self, signals: &[TradingSignal], now: DateTime<Utc>) -> RunOnceOutcome {
        let mut outcome = RunOnceOutcome { pending: signals.len(), ..Default::default() };
        for signal in signals {
            match self.execute_one(signal, now).await {
                Ok(true) => outcome.executed += 1,
                Ok(false) => outcome.failed += 1,
                Err(e) => {
                    outcome.failed += 1;
                    outcome.errors.push(format!("{}: {e}", signal.id));
                }
            }
        }
        outcome
    }

    pub async fn run_once(
        &self,
        account: Option<&str>,
        market: Option<&str>,
        trigger_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<RunOnceOutcome, AppError> {
        let as_of = trigger_at.unwrap_or(now);
        let pending = self.signals.list_pending(account, market, as_of)?;
        let mut outcome = RunOnceOutcome { pending: pending.len(), ..Default::default() };

        for signal in pending {
            match self.execute_one(&signal, as_of).await {
                Ok(true) => outcome.executed += 1,
                Ok(false) => outcome.failed += 1,
                Err(e) => {
                    outcome.failed += 1;
                    outcome.errors.push(format!("{}: {e}", signal.id));
                }
            }
        }
        Ok(outcome)
    }

    async fn execute_one(&self, signal: &TradingSignal, now: DateTime<Utc>) -> Result<bool, AppError> {
        let Some(broker) = self.broker_for(&signal.account) else {
            warn!(account = %signal.account, signal_id = %signal.id, "no broker registered for account type");
            self.signals.update_status(&signal.id, SignalStatus::Failed, None)?;
            return Ok(false);
        };

        let ok = match signal.kind.as_str() {
            "ORDER" => self.execute_order(signal, &*broker, now).await,
            "REBALANCE" | "ALLOCATION" => self.execute_rebalance(signal, &*broker, now).await,
            other => {
                error!(kind = other, signal_id = %signal.id, "unknown signal kind");
                Ok(false)
            }
        };

        match ok {
            Ok(true) => {
                self.signals.update_status(&signal.id, SignalStatus::Executed, Some(now))?;
                Ok(true)
            }
            Ok(false) => {
                self.signals.update_status(&signal.id, SignalStatus::Failed, None)?;
                Ok(false)
            }
            Err(e) => {
                self.signals.update_status(&signal.id, SignalStatus::Failed, None)?;
                Err(e)
            }
        }
    }

    async fn execute_order(&self, signal: &TradingSignal, broker: &dyn BrokerGateway, now: DateTime<Utc>) -> Result<bool, AppError> {
        let symbol = signal
            .symbol
            .as_deref()
            .ok_or_else(|| AppError::BadRequest("ORDER signal missing symbol".into()))?;
        let side = signal.payload["side"].as_str().unwrap_or("");
        let qty = signal.payload["qty"].as_f64().unwrap_or(0.0);
        if side.is_empty() || qty <= 0.0 {
            return Err(AppError::BadRequest("ORDER signal requires side and qty > 0".into()));
        }
        let price = signal.payload["price"].as_f64();
        let result = broker
            .place_order(symbol, side, qty, price, "market", Some(&signal.account), Some(now))
            .await;
        Ok(result.is_ok())
    }

    /// Diffs current vs target quantity per symbol and sends the resulting
    /// buy/sell orders to the broker (spec.md §4.8 steps a-f). Succeeds only
    /// if every diff-order succeeds.
    async fn execute_rebalance(&self, signal: &TradingSignal, broker: &dyn BrokerGateway, now: DateTime<Utc>) -> Result<bool, AppError> {
        let account_info = broker.get_account(Some(&signal.account)).await?;
        if account_info.total_assets <= 0.0 {
            return Err(AppError::BadRequest("cannot rebalance: equity <= 0".into()));
        }
        let equity = account_info.total_assets;

        let positions = broker.get_positions(Some(&signal.account)).await?;
        let mut current: HashMap<String, (f64, Option<f64>)> = HashMap::new();
        for p in &positions {
            current.insert(p.symbol.clone(), (p.qty, p.current_price.or(Some(p.avg_price))));
        }

        let target_weights: HashMap<String, f64> = signal.payload["target_weights"]
            .as_object()
            .map(|m| m.iter().filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f))).collect())
            .unwrap_or_default();
        let target_mv: HashMap<String, f64> = signal.payload["target_mv"]
            .as_object()
            .map(|m| m.iter().filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f))).collect())
            .unwrap_or_default();

        let mut symbols: HashSet<String> = current.keys().cloned().collect();
        symbols.extend(target_weights.keys().cloned());
        symbols.extend(target_mv.keys().cloned());

        let mut all_ok = true;
        for symbol in symbols {
            let (current_qty, current_price) = current.get(&symbol).cloned().unwrap_or((0.0, None));
            let price = match current_price {
                Some(p) if p > 0.0 => p,
                _ => broker.get_quote(&symbol).await?.price,
            };
            if price <= 0.0 {
                all_ok = false;
                continue;
            }

            let target_qty = if let Some(w) = target_weights.get(&symbol) {
                (equity * w) / price
            } else if let Some(mv) = target_mv.get(&symbol) {
                mv / price
            } else {
                0.0
            };

            let diff = target_qty - current_qty;
            if diff.abs() < 1e-6 {
                continue;
            }
            let side = if diff > 0.0 { "buy" } else { "sell" };
            let qty = (diff.abs() * 10_000.0).round() / 10_000.0;
            let sent = broker
                .place_order(&symbol, side, qty, None, "market", Some(&signal.account), Some(now))
                .await;
            if sent.is_err() {
                all_ok = false;
            }
        }
        Ok(all_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AccountInfo, BrokerOrder, BrokerPosition};
    use async_trait::async_trait;
    use parking_lot::Mutex as PMutex;
    use quant_core::{Interval, Quote};
    use serde_json::json;

    #[test]
    fn registry_returns_none_for_unregistered_broker_type() {
        let registry = BrokerRegistry::new();
        assert!(registry.get("futu").is_none());
    }

    /// Records every `place_order` call so tests can assert on the diff
    /// orders the rebalance math produced; account/position/quote responses
    /// are fixed per scenario.
    struct MockBroker {
        account: AccountInfo,
        positions: Vec<BrokerPosition>,
        prices: HashMap<String, f64>,
        placed: PMutex<Vec<(String, String, f64)>>,
    }

    impl MockBroker {
        fn new(account: AccountInfo, positions: Vec<BrokerPosition>, prices: HashMap<String, f64>) -> Self {
            Self { account, positions, prices, placed: PMutex::new(Vec::new()) }
        }

        fn orders(&self) -> Vec<(String, String, f64)> {
            self.placed.lock().clone()
        }
    }

    #[async_trait]
    impl BrokerGateway for MockBroker {
        async fn connect(&self) -> Result<(), AppError> {
            Ok(())
        }
        async fn disconnect(&self) {}
        fn is_connected(&self) -> bool {
            true
        }
        async fn get_quote(&self, symbol: &str) -> Result<Quote, AppError> {
            let price = *self.prices.get(symbol).ok_or_else(|| AppError::NotFound(symbol.to_string()))?;
            Ok(Quote { price, as_of: Utc::now() })
        }
        async fn get_history(
            &self,
            _symbol: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _interval: Interval,
        ) -> Result<Vec<quant_core::Bar>, AppError> {
            Ok(Vec::new())
        }
        async fn get_account(&self, _account: Option<&str>) -> Result<AccountInfo, AppError> {
            Ok(self.account.clone())
        }
        async fn get_positions(&self, _account: Option<&str>) -> Result<Vec<BrokerPosition>, AppError> {
            Ok(self.positions.clone())
        }
        async fn get_orders(&self, _account: Option<&str>) -> Result<Vec<BrokerOrder>, AppError> {
            Ok(Vec::new())
        }
        async fn place_order(
            &self,
            symbol: &str,
            side: &str,
            qty: f64,
            _price: Option<f64>,
            _order_type: &str,
            _account: Option<&str>,
            _sim_time: Option<DateTime<Utc>>,
        ) -> Result<String, AppError> {
            self.placed.lock().push((symbol.to_string(), side.to_string(), qty));
            Ok(format!("{symbol}-mock-order"))
        }
        async fn cancel_order(&self, _order_id: &str, _account: Option<&str>) -> Result<(), AppError> {
            Ok(())
        }
    }

    fn executor() -> SignalExecutor {
        let store = Arc::new(crate::store::ZuiLowStore::open(":memory:").expect("open in-memory store"));
        let signals = Arc::new(SignalStore::new(store));
        let brokers = Arc::new(BrokerRegistry::new());
        let config = Config {
            database_path: ":memory:".into(),
            port: 0,
            worker_pool_size: 1,
            tick_interval_secs: 1,
            default_account: "acc1".into(),
            default_mode: "paper".into(),
            default_qty: 0.0,
            ppt_url: String::new(),
            futu_url: None,
            ibkr_url: None,
            webhook_token: None,
            accounts: HashMap::new(),
            markets: Vec::new(),
        };
        SignalExecutor::new(signals, brokers, config)
    }

    fn allocation_signal(target_weights: serde_json::Value) -> TradingSignal {
        TradingSignal {
            id: "sig-1".into(),
            job_name: "test-job".into(),
            account: "acc1".into(),
            market: None,
            kind: "ALLOCATION".into(),
            symbol: None,
            payload: json!({ "target_weights": target_weights }),
            status: "PENDING".into(),
            created_at: Utc::now(),
            trigger_at: None,
            executed_at: None,
        }
    }

    /// spec.md §8 S2: 3-way allocation from cash into AAPL/MSFT/GOOG with no
    /// existing positions. `target_qty = equity * weight / price` for each
    /// symbol, all buys.
    #[tokio::test]
    async fn s2_three_way_allocation_buys_target_quantities() {
        let exec = executor();
        let broker = MockBroker::new(
            AccountInfo { cash: 100_000.0, total_assets: 100_000.0, market_value: 0.0, power: 100_000.0 },
            Vec::new(),
            HashMap::from([("AAPL".to_string(), 100.0), ("MSFT".to_string(), 200.0), ("GOOG".to_string(), 1000.0)]),
        );
        let signal = allocation_signal(json!({ "AAPL": 0.5, "MSFT": 0.3, "GOOG": 0.2 }));

        let ok = exec.execute_rebalance(&signal, &broker, Utc::now()).await.unwrap();
        assert!(ok);

        let mut orders = broker.orders();
        orders.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            orders,
            vec![
                ("AAPL".to_string(), "buy".to_string(), 500.0),
                ("GOOG".to_string(), "buy".to_string(), 20.0),
                ("MSFT".to_string(), "buy".to_string(), 150.0),
            ]
        );
    }

    /// spec.md §8 S3: rebalance against an existing AAPL position. Equity is
    /// cash + market value of the held position (50,000 + 500*100 = 100,000);
    /// target weights reshuffle into AAPL 0.6 / MSFT 0.4, producing a partial
    /// AAPL buy and a fresh MSFT buy.
    #[tokio::test]
    async fn s3_rebalance_against_existing_position_diffs_correctly() {
        let exec = executor();
        let broker = MockBroker::new(
            AccountInfo { cash: 50_000.0, total_assets: 100_000.0, market_value: 50_000.0, power: 50_000.0 },
            vec![BrokerPosition { symbol: "AAPL".into(), qty: 500.0, avg_price: 100.0, current_price: Some(100.0) }],
            HashMap::from([("MSFT".to_string(), 200.0)]),
        );
        let signal = allocation_signal(json!({ "AAPL": 0.6, "MSFT": 0.4 }));
        let signal = TradingSignal { kind: "REBALANCE".into(), ..signal };

        let ok = exec.execute_rebalance(&signal, &broker, Utc::now()).await.unwrap();
        assert!(ok);

        let mut orders = broker.orders();
        orders.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            orders,
            vec![("AAPL".to_string(), "buy".to_string(), 100.0), ("MSFT".to_string(), "buy".to_string(), 200.0),]
        );
    }
}

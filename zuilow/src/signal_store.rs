//! SignalStore (spec.md §4.5, C7): durable log of trading signals.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use quant_core::AppError;
use serde_json::Value;
use uuid::Uuid;

use crate::store::{SignalFilters, SignalStatus, TradingSignal, ZuiLowStore};

pub struct SignalStore {
    store: Arc<ZuiLowStore>,
}

pub struct NewSignal {
    pub job_name: String,
    pub account: String,
    pub market: Option<String>,
    pub kind: String,
    pub symbol: Option<String>,
    pub payload: Value,
    pub trigger_at: Option<DateTime<Utc>>,
}

impl SignalStore {
    pub fn new(store: Arc<ZuiLowStore>) -> Self {
        Self { store }
    }

    pub fn add(&self, s: NewSignal, created_at: DateTime<Utc>) -> Result<TradingSignal, AppError> {
        let row = TradingSignal {
            id: Uuid::new_v4().to_string(),
            job_name: s.job_name,
            account: s.account,
            market: s.market,
            kind: s.kind,
            symbol: s.symbol,
            payload: s.payload,
            status: SignalStatus::Pending.as_str().to_string(),
            created_at,
            trigger_at: s.trigger_at,
            executed_at: None,
        };
        self.store.insert_signal(&row)?;
        Ok(row)
    }

    pub fn add_many(&self, signals: Vec<NewSignal>, created_at: DateTime<Utc>) -> Result<Vec<TradingSignal>, AppError> {
        signals.into_iter().map(|s| self.add(s, created_at)).collect()
    }

    pub fn get(&self, id: &str) -> Result<Option<TradingSignal>, AppError> {
        self.store.get(id)
    }

    /// Idempotent: unknown or already-terminal signals return `false`
    /// (spec.md §7 `signal_not_pending`).
    pub fn cancel(&self, id: &str) -> Result<bool, AppError> {
        self.store.cancel(id)
    }

    pub fn update_status(&self, id: &str, status: SignalStatus, executed_at: Option<DateTime<Utc>>) -> Result<bool, AppError> {
        self.store.update_status(id, status, executed_at)
    }

    pub fn list_pending(&self, account: Option<&str>, market: Option<&str>, trigger_at_before: DateTime<Utc>) -> Result<Vec<TradingSignal>, AppError> {
        self.store.list_pending(account, market, trigger_at_before)
    }

    pub fn list_signals(&self, filters: &SignalFilters, offset: i64, limit: i64) -> Result<Vec<TradingSignal>, AppError> {
        self.store.list_signals(filters, offset, limit)
    }

    pub fn count_signals(&self, filters: &SignalFilters) -> Result<i64, AppError> {
        self.store.count_signals(filters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SignalStore {
        SignalStore::new(Arc::new(ZuiLowStore::open(":memory:").unwrap()))
    }

    #[test]
    fn cancel_unknown_signal_is_a_noop() {
        let s = store();
        assert!(!s.cancel("missing").unwrap());
    }

    #[test]
    fn status_never_transitions_backward_from_terminal() {
        let s = store();
        let now = Utc::now();
        let sig = s.add(
            NewSignal {
                job_name: "job".into(),
                account: "default".into(),
                market: Some("US".into()),
                kind: "ORDER".into(),
                symbol: Some("AAPL".into()),
                payload: json!({"side": "buy", "qty": 10.0}),
                trigger_at: None,
            },
            now,
        ).unwrap();
        assert!(s.update_status(&sig.id, SignalStatus::Executed, Some(now)).unwrap());
        // Already terminal: cannot move to FAILED.
        assert!(!s.update_status(&sig.id, SignalStatus::Failed, Some(now)).unwrap());
    }

    #[test]
    fn list_pending_is_fifo_by_created_at() {
        let s = store();
        let t0 = Utc::now();
        let a = s.add(NewSignal {
            job_name: "job".into(), account: "default".into(), market: None,
            kind: "ORDER".into(), symbol: Some("AAPL".into()),
            payload: json!({}), trigger_at: None,
        }, t0).unwrap();
        let b = s.add(NewSignal {
            job_name: "job".into(), account: "default".into(), market: None,
            kind: "ORDER".into(), symbol: Some("MSFT".into()),
            payload: json!({}), trigger_at: None,
        }, t0 + chrono::Duration::seconds(1)).unwrap();
        let pending = s.list_pending(None, None, t0 + chrono::Duration::seconds(5)).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, a.id);
        assert_eq!(pending[1].id, b.id);
    }
}

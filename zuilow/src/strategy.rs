//! StrategyRunner (spec.md §4.6, C8): loads a strategy, feeds it bars, and
//! converts whatever it emits into `TradingSignal` rows for the `SignalStore`.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use quant_core::{AppError, Bar, Interval};
use serde_json::{json, Value};

use crate::broker::BrokerGateway;
use crate::signal_store::NewSignal;

/// What a strategy hands back from a single bar or a portfolio-level call.
/// Opaque payload fields mirror spec.md §4.6's signal-dict schema; not every
/// field is populated for every kind.
#[derive(Debug, Clone, Default)]
pub struct SignalDict {
    pub kind: Option<String>,
    pub symbol: Option<String>,
    pub side: Option<String>,
    pub qty: Option<f64>,
    pub price: Option<f64>,
    pub target_weights: Option<HashMap<String, f64>>,
    pub target_mv: Option<HashMap<String, f64>>,
    pub timestamp: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

pub struct StrategyContext {
    pub account: String,
    pub params: Value,
    pub history: Vec<Bar>,
}

/// A stateful per-bar computation. `on_bar` may be called many times per
/// invocation of the runner; only the *last* non-`None` result is kept.
pub trait Strategy: Send {
    fn on_bar(&mut self, bar: &Bar, ctx: &StrategyContext) -> Option<SignalDict>;

    /// Portfolio-level hook; when it returns `Some`, the runner skips the
    /// per-symbol bar walk entirely (spec.md §4.6 step 1).
    fn get_rebalance_output(&mut self) -> Option<SignalDict> {
        None
    }
}

/// `run_strategy(strategy, symbols, account, job_name, market)` (spec.md
/// §4.6). `broker` supplies quotes and history so execution and quote share
/// the same gateway, avoiding cross-broker price drift.
pub async fn run_strategy(
    strategy: &mut dyn Strategy,
    symbols: &[String],
    account: &str,
    now: DateTime<Utc>,
    default_qty: f64,
    broker: &dyn BrokerGateway,
) -> Result<Vec<SignalDict>, AppError> {
    if let Some(output) = strategy.get_rebalance_output() {
        return Ok(vec![output]);
    }

    let mut out = Vec::new();
    for symbol in symbols {
        let quote = broker.get_quote(symbol).await?;
        let start = now - Duration::days(150);
        let bars = broker.get_history(symbol, start, now, Interval::Day1).await?;

        let ctx = StrategyContext {
            account: account.to_string(),
            params: json!({}),
            history: bars.clone(),
        };

        let mut last_signal = None;
        for bar in &bars {
            if let Some(signal) = strategy.on_bar(bar, &ctx) {
                last_signal = Some(signal);
            }
        }

        if let Some(mut signal) = last_signal {
            signal.symbol.get_or_insert_with(|| symbol.clone());
            signal.qty.get_or_insert(default_qty);
            let fallback_price = bars.last().map(|b| b.close).unwrap_or(quote.price);
            signal.price.get_or_insert(if quote.price > 0.0 { quote.price } else { fallback_price });
            signal.timestamp.get_or_insert(now);
            out.push(signal);
        }
    }
    Ok(out)
}

/// Infer a market code from a canonical symbol's exchange prefix (spec.md
/// §4.6 "Market inference rule").
pub fn infer_market(symbol: &str) -> String {
    if symbol.starts_with("HK.") {
        "HK".to_string()
    } else if symbol.starts_with("US.") {
        "US".to_string()
    } else {
        "UNKNOWN".to_string()
    }
}

/// Converts a list of signal dicts emitted by a strategy run into
/// `NewSignal`s ready for `SignalStore::add_many` (spec.md §4.6 "Conversion
/// to TradingSignal").
pub fn convert_to_signals(
    dicts: Vec<SignalDict>,
    job_name: &str,
    account: &str,
    market: Option<String>,
    trigger_at: Option<DateTime<Utc>>,
) -> Vec<NewSignal> {
    dicts
        .into_iter()
        .map(|d| {
            let is_allocation = d.kind.as_deref() == Some("allocation") || (d.target_weights.is_some() && d.kind.is_none() && d.symbol.is_none());
            let is_rebalance = !is_allocation && (d.kind.as_deref() == Some("rebalance") || d.target_weights.is_some() || d.target_mv.is_some());

            if is_allocation {
                NewSignal {
                    job_name: job_name.to_string(),
                    account: account.to_string(),
                    market: market.clone(),
                    kind: "ALLOCATION".to_string(),
                    symbol: None,
                    payload: json!({ "target_weights": d.target_weights.unwrap_or_default() }),
                    trigger_at,
                }
            } else if is_rebalance {
                let payload = match (&d.target_weights, &d.target_mv) {
                    (Some(w), _) => json!({ "target_weights": w }),
                    (None, Some(mv)) => json!({ "target_mv": mv }),
                    (None, None) => json!({}),
                };
                NewSignal {
                    job_name: job_name.to_string(),
                    account: account.to_string(),
                    market: market.clone(),
                    kind: "REBALANCE".to_string(),
                    symbol: None,
                    payload,
                    trigger_at,
                }
            } else {
                let inferred_market = market.clone().or_else(|| d.symbol.as_deref().map(infer_market));
                NewSignal {
                    job_name: job_name.to_string(),
                    account: account.to_string(),
                    market: inferred_market,
                    kind: "ORDER".to_string(),
                    symbol: d.symbol.clone(),
                    payload: json!({ "side": d.side, "qty": d.qty, "price": d.price, "reason": d.reason }),
                    trigger_at,
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_market_from_prefix() {
        assert_eq!(infer_market("US.AAPL"), "US");
        assert_eq!(infer_market("HK.00700"), "HK");
        assert_eq!(infer_market("SH.600519"), "UNKNOWN");
    }

    #[test]
    fn order_dict_converts_with_inferred_market() {
        let dicts = vec![SignalDict {
            symbol: Some("US.AAPL".into()),
            side: Some("buy".into()),
            qty: Some(10.0),
            price: Some(180.0),
            ..Default::default()
        }];
        let signals = convert_to_signals(dicts, "job1", "default", None, None);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, "ORDER");
        assert_eq!(signals[0].market.as_deref(), Some("US"));
    }

    #[test]
    fn allocation_dict_converts_with_no_symbol() {
        let mut weights = HashMap::new();
        weights.insert("AAPL".to_string(), 0.5);
        let dicts = vec![SignalDict {
            kind: Some("allocation".into()),
            target_weights: Some(weights),
            ..Default::default()
        }];
        let signals = convert_to_signals(dicts, "job1", "default", Some("US".into()), None);
        assert_eq!(signals[0].kind, "ALLOCATION");
        assert!(signals[0].symbol.is_none());
    }
}

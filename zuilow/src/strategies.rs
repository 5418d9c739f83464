//! Built-in strategy implementations.
//!
//! A statically-typed registry replaces the source's package-walking
//! subclass discovery (spec.md §9 "Dynamic strategy loading"): strategies
//! register themselves under a string name in `main()` via
//! `Scheduler::register_strategy`.

use std::collections::HashMap;

use quant_core::Bar;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::scheduler::StrategyFactory;
use crate::strategy::{SignalDict, Strategy, StrategyContext};

/// Per-symbol SMA crossover: emits `buy` when the short average crosses
/// above the long average and `sell` on the reverse cross. Stateless across
/// bars other than the rolling window, matching the on_bar contract of
/// spec.md §4.6.
pub struct MovingAverageCrossover {
    short_window: usize,
    long_window: usize,
    closes: Vec<f64>,
    was_above: Option<bool>,
}

impl MovingAverageCrossover {
    pub fn new(short_window: usize, long_window: usize) -> Self {
        Self {
            short_window,
            long_window,
            closes: Vec::new(),
            was_above: None,
        }
    }
}

fn sma(values: &[f64], window: usize) -> Option<f64> {
    if values.len() < window {
        return None;
    }
    let slice = &values[values.len() - window..];
    Some(slice.iter().sum::<f64>() / window as f64)
}

impl Strategy for MovingAverageCrossover {
    fn on_bar(&mut self, bar: &Bar, _ctx: &StrategyContext) -> Option<SignalDict> {
        self.closes.push(bar.close);
        let short = sma(&self.closes, self.short_window)?;
        let long = sma(&self.closes, self.long_window)?;
        let above = short > long;
        let signal = match self.was_above {
            Some(prev_above) if prev_above != above => Some(SignalDict {
                side: Some(if above { "buy" } else { "sell" }.to_string()),
                reason: Some(format!(
                    "sma{}/sma{} cross at {}",
                    self.short_window, self.long_window, bar.timestamp
                )),
                ..Default::default()
            }),
            _ => None,
        };
        self.was_above = Some(above);
        signal
    }
}

pub struct MovingAverageCrossoverFactory {
    pub short_window: usize,
    pub long_window: usize,
}

impl StrategyFactory for MovingAverageCrossoverFactory {
    fn create(&self) -> Box<dyn Strategy> {
        Box::new(MovingAverageCrossover::new(self.short_window, self.long_window))
    }
}

/// Portfolio-level allocation over a fixed candidate pool, grounded on
/// `original_source/zuilow/strategies/random_buy_sell.py`'s
/// `RandomBuyOrSell`: picks `pick_count` symbols at random and assigns
/// random normalized weights. `on_bar` never fires — `get_rebalance_output`
/// always short-circuits the per-symbol bar walk (spec.md §4.6 step 1).
pub struct RandomAllocation {
    pool: Vec<String>,
    pick_count: usize,
}

impl RandomAllocation {
    pub fn new(pool: Vec<String>, pick_count: usize) -> Self {
        Self { pool, pick_count }
    }
}

impl Strategy for RandomAllocation {
    fn on_bar(&mut self, _bar: &Bar, _ctx: &StrategyContext) -> Option<SignalDict> {
        None
    }

    fn get_rebalance_output(&mut self) -> Option<SignalDict> {
        if self.pool.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        let n = self.pick_count.min(self.pool.len());
        let chosen: Vec<&String> = self.pool.choose_multiple(&mut rng, n).collect();
        let raw: Vec<f64> = chosen.iter().map(|_| rng.gen_range(0.01..1.0)).collect();
        let total: f64 = raw.iter().sum();
        let mut weights: HashMap<String, f64> = HashMap::new();
        for (symbol, w) in chosen.into_iter().zip(raw) {
            weights.insert(symbol.clone(), w / total);
        }
        Some(SignalDict {
            kind: Some("allocation".to_string()),
            target_weights: Some(weights),
            ..Default::default()
        })
    }
}

pub struct RandomAllocationFactory {
    pub pool: Vec<String>,
    pub pick_count: usize,
}

impl StrategyFactory for RandomAllocationFactory {
    fn create(&self) -> Box<dyn Strategy> {
        Box::new(RandomAllocation::new(self.pool.clone(), self.pick_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(close: f64) -> Bar {
        Bar {
            symbol: "US.AAPL".into(),
            interval: quant_core::Interval::Day1.as_str().to_string(),
            timestamp: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1000.0,
        }
    }

    #[test]
    fn crossover_emits_no_signal_before_long_window_fills() {
        let mut strat = MovingAverageCrossover::new(2, 5);
        let ctx = StrategyContext { account: "default".into(), params: serde_json::json!({}), history: vec![] };
        for c in [1.0, 2.0, 3.0] {
            assert!(strat.on_bar(&bar(c), &ctx).is_none());
        }
    }

    #[test]
    fn crossover_emits_buy_when_short_crosses_above_long() {
        let mut strat = MovingAverageCrossover::new(2, 4);
        let ctx = StrategyContext { account: "default".into(), params: serde_json::json!({}), history: vec![] };
        let mut last = None;
        for c in [10.0, 10.0, 10.0, 10.0, 20.0, 30.0] {
            if let Some(s) = strat.on_bar(&bar(c), &ctx) {
                last = Some(s);
            }
        }
        assert_eq!(last.unwrap().side.as_deref(), Some("buy"));
    }

    #[test]
    fn random_allocation_weights_sum_to_one() {
        let mut strat = RandomAllocation::new(vec!["A".into(), "B".into(), "C".into()], 2);
        let out = strat.get_rebalance_output().unwrap();
        let weights = out.target_weights.unwrap();
        let sum: f64 = weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn random_allocation_empty_pool_yields_nothing() {
        let mut strat = RandomAllocation::new(vec![], 5);
        assert!(strat.get_rebalance_output().is_none());
    }
}

//! Task kinds: incremental, full-sync, validation, repair (spec.md §4.3).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use quant_core::{Bar, BarStore, Clock, Fetcher, Interval};
use serde::Serialize;
use tracing::warn;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Incremental,
    FullSync,
    Validation,
    Repair,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Incremental => "incremental",
            TaskKind::FullSync => "full_sync",
            TaskKind::Validation => "validation",
            TaskKind::Repair => "repair",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRunOutcome {
    pub data_count: i64,
    pub message: Option<String>,
    pub issues: Vec<String>,
}

/// Incremental: fetch `(latest, now]` per symbol; seed with `initial_days`
/// of history when the store is empty.
pub async fn run_incremental(
    store: &dyn BarStore,
    fetcher: &dyn Fetcher,
    clock: &Clock,
    config: &Config,
    symbols: &[String],
    interval: Interval,
) -> Result<TaskRunOutcome, quant_core::AppError> {
    let now = clock.now();
    let mut total = 0i64;
    for symbol in symbols {
        let latest = store.get_latest(symbol, interval).await?;
        let (start, warn_gap) = match latest {
            Some(t) => {
                let gap = now - t;
                (t + Duration::days(1), gap > Duration::days(config.gap_threshold_days))
            }
            None => (now - Duration::days(config.initial_days), false),
        };
        if warn_gap {
            warn!(symbol, "incremental gap exceeds gap_threshold_days, fetching anyway");
        }
        if start > now {
            continue;
        }
        let bars = fetcher.history(symbol, interval, start, now).await?;
        let fresh: Vec<Bar> = bars
            .into_iter()
            .filter(|b| latest.map(|t| b.timestamp > t).unwrap_or(true))
            .collect();
        if !fresh.is_empty() {
            total += store.write_bars(&fresh).await? as i64;
        }
    }
    Ok(TaskRunOutcome {
        data_count: total,
        message: Some(format!("incremental updated {total} rows")),
        issues: vec![],
    })
}

/// Full-sync: re-fetch `[start, end]` and overwrite the store for every symbol.
pub async fn run_full_sync(
    store: &dyn BarStore,
    fetcher: &dyn Fetcher,
    symbols: &[String],
    interval: Interval,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<TaskRunOutcome, quant_core::AppError> {
    let mut total = 0i64;
    for symbol in symbols {
        let bars = fetcher.history(symbol, interval, start, end).await?;
        total += store
            .overwrite_range(symbol, interval, start, end, &bars)
            .await? as i64;
    }
    Ok(TaskRunOutcome {
        data_count: total,
        message: Some(format!("full_sync wrote {total} rows")),
        issues: vec![],
    })
}

/// Validation: read-only check over `check_range` days; no writes.
pub async fn run_validation(
    store: &dyn BarStore,
    clock: &Clock,
    config: &Config,
    symbols: &[String],
    interval: Interval,
) -> Result<TaskRunOutcome, quant_core::AppError> {
    let now = clock.now();
    let start = now - Duration::days(config.check_range_days);
    let mut issues = Vec::new();
    let mut checked = 0i64;
    for symbol in symbols {
        let bars = store.read_history(symbol, interval, start, now).await?;
        let mut prev_close: Option<f64> = None;
        for bar in &bars {
            checked += 1;
            if bar.volume == 0.0 {
                issues.push(format!("{symbol} {}: zero volume", bar.timestamp));
            }
            if bar.open <= 0.0 || bar.high <= 0.0 || bar.low <= 0.0 || bar.close <= 0.0 {
                issues.push(format!("{symbol} {}: non-positive price", bar.timestamp));
            }
            let max_oc = bar.open.max(bar.close);
            let min_oc = bar.open.min(bar.close);
            if bar.high < max_oc || bar.low > min_oc {
                issues.push(format!("{symbol} {}: OHLC inconsistent", bar.timestamp));
            }
            if let Some(prev) = prev_close {
                if prev > 0.0 {
                    let change = (bar.close - prev).abs() / prev;
                    if change > config.max_price_change {
                        issues.push(format!(
                            "{symbol} {}: price change {:.2}% exceeds max_price_change",
                            bar.timestamp,
                            change * 100.0
                        ));
                    }
                }
            }
            prev_close = Some(bar.close);
        }
    }
    Ok(TaskRunOutcome {
        data_count: checked,
        message: Some(format!("validated {checked} rows, {} issues", issues.len())),
        issues,
    })
}

/// Repair: compare stored vs fresh recent range; overwrite rows that drift
/// by more than `repair_threshold_pct`.
pub async fn run_repair(
    store: &dyn BarStore,
    fetcher: &dyn Fetcher,
    clock: &Clock,
    config: &Config,
    symbols: &[String],
    interval: Interval,
) -> Result<TaskRunOutcome, quant_core::AppError> {
    let now = clock.now();
    let start = now - Duration::days(config.check_range_days);
    let mut repaired = 0i64;
    for symbol in symbols {
        let stored = store.read_history(symbol, interval, start, now).await?;
        let fresh = fetcher.history(symbol, interval, start, now).await?;
        let mut fresh_by_ts = std::collections::HashMap::new();
        for bar in &fresh {
            fresh_by_ts.insert(bar.timestamp, bar.clone());
        }
        let mut to_write = Vec::new();
        for old in &stored {
            if let Some(new) = fresh_by_ts.get(&old.timestamp) {
                if old.close > 0.0 {
                    let drift = (old.close - new.close).abs() / old.close;
                    if drift > config.repair_threshold_pct {
                        to_write.push(new.clone());
                    }
                }
            }
        }
        if !to_write.is_empty() {
            repaired += store.write_bars(&to_write).await? as i64;
        }
    }
    Ok(TaskRunOutcome {
        data_count: repaired,
        message: Some(format!("repaired {repaired} rows")),
        issues: vec![],
    })
}

pub type SharedFetcher = Arc<dyn Fetcher>;
pub type SharedStore = Arc<dyn BarStore>;

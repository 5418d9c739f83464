//! OHLCV bar and the `BarStore` interface.
//!
//! The physical time-series store backend is an external collaborator
//! (spec.md §1) — this module defines the contract every service programs
//! against; `dms` provides the one concrete (SQLite) implementation that
//! actually ships in this workspace.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::symbol::canonicalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "1d")]
    Day1,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Min1 => "1m",
            Interval::Min5 => "5m",
            Interval::Hour1 => "1h",
            Interval::Day1 => "1d",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "1m" => Interval::Min1,
            "5m" => Interval::Min5,
            "1h" => Interval::Hour1,
            _ => Interval::Day1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub interval: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(
        symbol: &str,
        interval: Interval,
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, AppError> {
        let symbol = canonicalize(symbol);
        let bar = Self {
            symbol,
            interval: interval.as_str().to_string(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        };
        bar.validate()?;
        Ok(bar)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.volume < 0.0 {
            return Err(AppError::BadRequest(format!(
                "bar {} {}: negative volume {}",
                self.symbol, self.timestamp, self.volume
            )));
        }
        let max_oc = self.open.max(self.close);
        let min_oc = self.open.min(self.close);
        if self.low > min_oc || self.high < max_oc {
            return Err(AppError::BadRequest(format!(
                "bar {} {}: OHLC inconsistent (O={} H={} L={} C={})",
                self.symbol, self.timestamp, self.open, self.high, self.low, self.close
            )));
        }
        Ok(())
    }
}

/// Uniform read/write contract over a time-series bar store.
#[async_trait]
pub trait BarStore: Send + Sync {
    async fn write_bars(&self, bars: &[Bar]) -> Result<usize, AppError>;

    /// Overwrite any existing rows in `[start, end]` for `(symbol, interval)`
    /// with `bars` (used by full-sync and repair).
    async fn overwrite_range(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bars: &[Bar],
    ) -> Result<usize, AppError>;

    async fn read_history(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, AppError>;

    async fn get_latest(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<Option<DateTime<Utc>>, AppError>;

    async fn symbols(&self) -> Result<Vec<String>, AppError>;

    async fn record_count(&self, symbol: &str, interval: Interval) -> Result<u64, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_negative_volume() {
        let now = Utc::now();
        assert!(Bar::new("aapl", Interval::Day1, now, 1.0, 2.0, 0.5, 1.5, -1.0).is_err());
    }

    #[test]
    fn rejects_inconsistent_ohlc() {
        let now = Utc::now();
        // high below close
        assert!(Bar::new("aapl", Interval::Day1, now, 1.0, 1.2, 0.9, 2.0, 10.0).is_err());
    }

    #[test]
    fn canonicalizes_symbol_on_construction() {
        let now = Utc::now();
        let bar = Bar::new("700", Interval::Day1, now, 1.0, 2.0, 0.5, 1.5, 10.0).unwrap();
        assert_eq!(bar.symbol, "HK.00700");
    }
}

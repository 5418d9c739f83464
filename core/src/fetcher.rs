//! External market data provider interface.
//!
//! The real upstream (Yahoo-style history/quote provider) is an external
//! collaborator (spec.md §1); this crate only defines the trait plus a
//! deterministic synthetic fetcher used by tests and local runs so that the
//! rest of the platform has something to fetch against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::bar::{Bar, Interval};
use crate::error::AppError;

#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub price: f64,
    pub as_of: DateTime<Utc>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn history(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, AppError>;

    async fn quote(&self, symbol: &str) -> Result<Quote, AppError>;
}

/// Deterministic synthetic fetcher: a fixed-seed pseudo-random walk keyed by
/// symbol and day, so repeated calls for the same `(symbol, day)` are
/// reproducible without network access. Stand-in for the real market data
/// provider, which is out of scope (spec.md §1).
pub struct SyntheticFetcher {
    pub base_price: f64,
}

impl Default for SyntheticFetcher {
    fn default() -> Self {
        Self { base_price: 100.0 }
    }
}

fn day_seed(symbol: &str, day: chrono::NaiveDate) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    symbol.hash(&mut hasher);
    day.hash(&mut hasher);
    hasher.finish()
}

fn pseudo_unit(seed: u64) -> f64 {
    use rand::{Rng, SeedableRng};
    rand::rngs::StdRng::seed_from_u64(seed).gen_range(0.0..1.0)
}

#[async_trait]
impl Fetcher for SyntheticFetcher {
    async fn history(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, AppError> {
        if end < start {
            return Err(AppError::BadRequest("end before start".into()));
        }
        let mut bars = Vec::new();
        let mut day = start.date_naive();
        let mut price = self.base_price + pseudo_unit(day_seed(symbol, day)) * 20.0;
        while day <= end.date_naive() {
            let drift = (pseudo_unit(day_seed(symbol, day)) - 0.5) * 2.0;
            let open = price;
            let close = (open + drift).max(0.01);
            let high = open.max(close) + pseudo_unit(day_seed(symbol, day)) * 0.5;
            let low = (open.min(close) - pseudo_unit(day_seed(symbol, day)) * 0.5).max(0.01);
            let volume = 1_000.0 + pseudo_unit(day_seed(symbol, day)) * 9_000.0;
            let ts = day
                .and_hms_opt(0, 0, 0)
                .unwrap()
                .and_local_timezone(Utc)
                .unwrap();
            bars.push(Bar::new(symbol, interval, ts, open, high, low, close, volume)?);
            price = close;
            day += chrono::Duration::days(1);
        }
        Ok(bars)
    }

    async fn quote(&self, symbol: &str) -> Result<Quote, AppError> {
        let now = Utc::now();
        let price = self.base_price + pseudo_unit(day_seed(symbol, now.date_naive())) * 20.0;
        Ok(Quote { price, as_of: now })
    }
}

//! LRU read-cache in front of `BarStore::read_history`, keyed by
//! `(symbol, start, end, interval)` (spec.md §4.3 "Read API").
//! Grounded on `original_source/zuilow/components/utils/cache.py`: one lock
//! guards both the map and the access-order list.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quant_core::{Bar, Interval};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    symbol: String,
    interval: &'static str,
    start: i64,
    end: i64,
}

struct Entry {
    bars: Vec<Bar>,
    inserted_at: Instant,
}

struct Inner {
    map: HashMap<CacheKey, Entry>,
    order: Vec<CacheKey>,
}

pub struct ReadCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl ReadCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: Vec::new(),
            }),
            capacity,
            ttl,
        }
    }

    fn key(symbol: &str, interval: Interval, start: DateTime<Utc>, end: DateTime<Utc>) -> CacheKey {
        CacheKey {
            symbol: symbol.to_string(),
            interval: interval.as_str(),
            start: start.timestamp(),
            end: end.timestamp(),
        }
    }

    pub fn get(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<Vec<Bar>> {
        let key = Self::key(symbol, interval, start, end);
        let mut inner = self.inner.lock();
        let expired = inner
            .map
            .get(&key)
            .map(|e| e.inserted_at.elapsed() > self.ttl)
            .unwrap_or(false);
        if expired {
            inner.map.remove(&key);
            inner.order.retain(|k| k != &key);
            return None;
        }
        if let Some(entry) = inner.map.get(&key) {
            let bars = entry.bars.clone();
            inner.order.retain(|k| k != &key);
            inner.order.push(key);
            return Some(bars);
        }
        None
    }

    pub fn put(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bars: Vec<Bar>,
    ) {
        let key = Self::key(symbol, interval, start, end);
        let mut inner = self.inner.lock();
        inner.order.retain(|k| k != &key);
        inner.order.push(key.clone());
        inner.map.insert(
            key,
            Entry {
                bars,
                inserted_at: Instant::now(),
            },
        );
        while inner.order.len() > self.capacity {
            let evict = inner.order.remove(0);
            inner.map.remove(&evict);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar() -> Bar {
        Bar::new("AAPL", Interval::Day1, Utc::now(), 1.0, 2.0, 0.5, 1.5, 10.0).unwrap()
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ReadCache::new(2, Duration::from_secs(60));
        let t0 = Utc::now();
        cache.put("A", Interval::Day1, t0, t0, vec![bar()]);
        cache.put("B", Interval::Day1, t0, t0, vec![bar()]);
        cache.put("C", Interval::Day1, t0, t0, vec![bar()]);
        assert!(cache.get("A", Interval::Day1, t0, t0).is_none());
        assert!(cache.get("B", Interval::Day1, t0, t0).is_some());
        assert!(cache.get("C", Interval::Day1, t0, t0).is_some());
    }

    #[test]
    fn expires_after_ttl() {
        let cache = ReadCache::new(10, Duration::from_millis(1));
        let t0 = Utc::now();
        cache.put("A", Interval::Day1, t0, t0, vec![bar()]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("A", Interval::Day1, t0, t0).is_none());
    }
}

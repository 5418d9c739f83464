//! Parallel per-backup replication (spec.md §4.3 "Replication").
//!
//! Two paths: a fan-out pool that copies newly-written bars to every
//! enabled backup best-effort (realtime fan-out), and an explicit
//! incremental/full-sync replication task per backup used by the
//! replication-trigger endpoints. Connection failure to a backup is
//! non-fatal (spec.md §7 `store_unreachable` backup row); only the
//! primary store's unreachability is fatal at startup.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use quant_core::{AppError, BarStore, Fetcher, Interval};
use reqwest::Client;
use tracing::{info, warn};

use crate::config::Config;
use crate::store::SqliteBarStore;

pub struct ReplicationManager {
    store: Arc<SqliteBarStore>,
    fetcher: Arc<dyn Fetcher>,
    config: Config,
    http: Client,
}

impl ReplicationManager {
    pub fn new(store: Arc<SqliteBarStore>, fetcher: Arc<dyn Fetcher>, config: Config) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            store,
            fetcher,
            config,
            http,
        }
    }

    /// Best-effort background copy of the just-written symbols to every
    /// enabled backup. Failures are logged, never propagated: the primary
    /// write already succeeded.
    pub async fn fan_out(self: &Arc<Self>, symbols: Vec<String>, interval: Interval) {
        if self.config.backup_urls.is_empty() {
            return;
        }
        let permits = Arc::new(tokio::sync::Semaphore::new(self.config.fan_out_pool_size));
        let mut handles = Vec::new();
        for backup in self.config.backup_urls.clone() {
            for symbol in symbols.clone() {
                let this = self.clone();
                let permits = permits.clone();
                let backup = backup.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permits.acquire().await;
                    if let Err(e) = this.replicate_incremental(&backup, &symbol, interval).await {
                        warn!(backup, symbol, error = %e, "realtime replication failed, will reconcile on next incremental run");
                    }
                }));
            }
        }
        for h in handles {
            let _ = h.await;
        }
    }

    /// Incremental replication to a single backup: copy `(last_sync, now]`.
    pub async fn replicate_incremental(
        &self,
        backup: &str,
        symbol: &str,
        interval: Interval,
    ) -> Result<usize, AppError> {
        let last_sync = self.store.last_sync_time(backup, symbol, interval)?;
        let now = Utc::now();
        let start = last_sync.unwrap_or_else(|| now - chrono::Duration::days(self.config.initial_days));
        if start >= now {
            return Ok(0);
        }
        let bars = self.store.read_history(symbol, interval, start, now).await?;
        let bars: Vec<_> = bars.into_iter().filter(|b| last_sync.map(|t| b.timestamp > t).unwrap_or(true)).collect();
        let count = bars.len();
        self.push_to_backup(backup, &bars).await?;
        self.store.set_last_sync_time(backup, symbol, interval, now)?;
        self.store
            .record_sync_run(backup, symbol, interval, start, now, "completed", count as i64)?;
        Ok(count)
    }

    /// Full-sync replication to a single backup: copy the fixed range.
    pub async fn replicate_full_sync(
        &self,
        backup: &str,
        symbol: &str,
        interval: Interval,
    ) -> Result<usize, AppError> {
        let now = Utc::now();
        let start = now - chrono::Duration::days(self.config.initial_days);
        let bars = self.store.read_history(symbol, interval, start, now).await?;
        let count = bars.len();
        self.push_to_backup(backup, &bars).await?;
        self.store.set_last_sync_time(backup, symbol, interval, now)?;
        self.store
            .record_sync_run(backup, symbol, interval, start, now, "completed", count as i64)?;
        Ok(count)
    }

    async fn push_to_backup(&self, backup: &str, bars: &[quant_core::Bar]) -> Result<(), AppError> {
        if bars.is_empty() {
            return Ok(());
        }
        // A real backup is a second DMS instance; this pushes through its
        // own bar-write contract. The fetcher's quote endpoint is re-used
        // here only as a liveness probe point is out of scope; this posts
        // raw bars to the backup's ingest endpoint.
        let url = format!("{}/api/dms/replicate", backup.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(bars)
            .send()
            .await
            .map_err(|e| AppError::StoreUnreachable(format!("backup {backup}: {e}")))?;
        if !resp.status().is_success() {
            return Err(AppError::StoreUnreachable(format!(
                "backup {backup} responded {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // Replication is exercised end-to-end in the scheduler tests; this
    // module's pure scheduling/accounting logic (not HTTP) is what's
    // worth unit testing in isolation, and it lives in store.rs's
    // last_sync_time/set_last_sync_time round-trip tests.
    use super::*;

    #[tokio::test]
    async fn no_backups_configured_is_a_noop() {
        let store = Arc::new(SqliteBarStore::open(":memory:").unwrap());
        let fetcher: Arc<dyn Fetcher> = Arc::new(quant_core::SyntheticFetcher::default());
        let config = Config {
            database_path: ":memory:".into(),
            port: 0,
            role: "master".into(),
            fan_out_pool_size: 5,
            retry_times: 3,
            retry_delay: Duration::from_secs(1),
            gap_threshold_days: 5,
            initial_days: 30,
            check_range_days: 30,
            max_price_change: 0.5,
            repair_threshold_pct: 0.01,
            cache_capacity: 10,
            cache_ttl: Duration::from_secs(60),
            webhook_token: None,
            backup_urls: vec![],
        };
        let manager = Arc::new(ReplicationManager::new(store, fetcher, config));
        manager.fan_out(vec!["AAPL".into()], Interval::Day1).await;
    }
}

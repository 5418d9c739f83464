//! SQLite-backed `BarStore`, plus the maintenance_log and sync_history
//! tables DMS owns per spec.md §6.5.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quant_core::{error::AppError, symbol::canonicalize, Bar, BarStore, Interval};
use rusqlite::{params, Connection};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS bars (
    symbol TEXT NOT NULL,
    interval TEXT NOT NULL,
    ts TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    PRIMARY KEY (symbol, interval, ts)
);
CREATE INDEX IF NOT EXISTS idx_bars_symbol_interval_ts ON bars(symbol, interval, ts DESC);

CREATE TABLE IF NOT EXISTS maintenance_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_name TEXT NOT NULL,
    task_kind TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    status TEXT NOT NULL,
    data_count INTEGER NOT NULL DEFAULT 0,
    message TEXT,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_maintenance_log_task ON maintenance_log(task_name, start_time DESC);

CREATE TABLE IF NOT EXISTS sync_history (
    backup TEXT NOT NULL,
    symbol TEXT NOT NULL,
    interval TEXT NOT NULL,
    last_sync_time TEXT,
    PRIMARY KEY (backup, symbol, interval)
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    backup TEXT NOT NULL,
    symbol TEXT NOT NULL,
    interval TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    status TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0
);
"#;

pub struct SqliteBarStore {
    conn: Mutex<Connection>,
}

impl SqliteBarStore {
    pub fn open(path: &str) -> Result<Self, AppError> {
        let conn = Connection::open(path)
            .map_err(|e| AppError::StoreUnreachable(format!("open {path}: {e}")))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn record_maintenance_start(
        &self,
        task_name: &str,
        task_kind: &str,
        start: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO maintenance_log (task_name, task_kind, start_time, status, data_count) \
             VALUES (?1, ?2, ?3, 'running', 0)",
            params![task_name, task_kind, start.to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn record_maintenance_end(
        &self,
        id: i64,
        end: DateTime<Utc>,
        status: &str,
        data_count: i64,
        message: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE maintenance_log SET end_time = ?1, status = ?2, data_count = ?3, message = ?4, error = ?5 WHERE id = ?6",
            params![end.to_rfc3339(), status, data_count, message, error, id],
        )?;
        Ok(())
    }

    /// Last logged status for `task_name`, used to derive post-restart state.
    pub fn last_task_status(&self, task_name: &str) -> Result<Option<String>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT status FROM maintenance_log WHERE task_name = ?1 ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![task_name])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get::<_, String>(0)?))
        } else {
            Ok(None)
        }
    }

    pub fn maintenance_log(
        &self,
        task_name: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MaintenanceLogRow>, AppError> {
        let conn = self.conn.lock();
        let mut rows_out = Vec::new();
        if let Some(name) = task_name {
            let mut stmt = conn.prepare(
                "SELECT id, task_name, task_kind, start_time, end_time, status, data_count, message, error \
                 FROM maintenance_log WHERE task_name = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3",
            )?;
            let mut rows = stmt.query(params![name, limit, offset])?;
            while let Some(row) = rows.next()? {
                rows_out.push(MaintenanceLogRow::from_row(row)?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, task_name, task_kind, start_time, end_time, status, data_count, message, error \
                 FROM maintenance_log ORDER BY id DESC LIMIT ?1 OFFSET ?2",
            )?;
            let mut rows = stmt.query(params![limit, offset])?;
            while let Some(row) = rows.next()? {
                rows_out.push(MaintenanceLogRow::from_row(row)?);
            }
        }
        Ok(rows_out)
    }

    pub fn last_sync_time(
        &self,
        backup: &str,
        symbol: &str,
        interval: Interval,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT last_sync_time FROM sync_history WHERE backup = ?1 AND symbol = ?2 AND interval = ?3",
        )?;
        let mut rows = stmt.query(params![backup, symbol, interval.as_str()])?;
        if let Some(row) = rows.next()? {
            let t: Option<String> = row.get(0)?;
            Ok(t.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)))
        } else {
            Ok(None)
        }
    }

    pub fn set_last_sync_time(
        &self,
        backup: &str,
        symbol: &str,
        interval: Interval,
        t: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_history (backup, symbol, interval, last_sync_time) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(backup, symbol, interval) DO UPDATE SET last_sync_time = excluded.last_sync_time",
            params![backup, symbol, interval.as_str(), t.to_rfc3339()],
        )?;
        Ok(())
    }

    /// `POST /database/clear` — destructive, master-role only (spec.md §6.1).
    pub fn clear_all(&self) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "DELETE FROM bars; DELETE FROM maintenance_log; DELETE FROM sync_history; DELETE FROM sync_runs;",
        )?;
        Ok(())
    }

    pub fn record_sync_run(
        &self,
        backup: &str,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: &str,
        count: i64,
    ) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_runs (backup, symbol, interval, start_time, end_time, status, count) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                backup,
                symbol,
                interval.as_str(),
                start.to_rfc3339(),
                end.to_rfc3339(),
                status,
                count
            ],
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MaintenanceLogRow {
    pub id: i64,
    pub task_name: String,
    pub task_kind: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub status: String,
    pub data_count: i64,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl MaintenanceLogRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_name: row.get(1)?,
            task_kind: row.get(2)?,
            start_time: row.get(3)?,
            end_time: row.get(4)?,
            status: row.get(5)?,
            data_count: row.get(6)?,
            message: row.get(7)?,
            error: row.get(8)?,
        })
    }
}

#[async_trait]
impl BarStore for SqliteBarStore {
    async fn write_bars(&self, bars: &[Bar]) -> Result<usize, AppError> {
        for bar in bars {
            bar.validate()?;
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO bars (symbol, interval, ts, open, high, low, close, volume) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(symbol, interval, ts) DO UPDATE SET \
                 open=excluded.open, high=excluded.high, low=excluded.low, close=excluded.close, volume=excluded.volume",
            )?;
            for bar in bars {
                stmt.execute(params![
                    canonicalize(&bar.symbol),
                    bar.interval,
                    bar.timestamp.to_rfc3339(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume
                ])?;
            }
        }
        tx.commit()?;
        Ok(bars.len())
    }

    async fn overwrite_range(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bars: &[Bar],
    ) -> Result<usize, AppError> {
        let symbol = canonicalize(symbol);
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM bars WHERE symbol = ?1 AND interval = ?2 AND ts >= ?3 AND ts <= ?4",
            params![symbol, interval.as_str(), start.to_rfc3339(), end.to_rfc3339()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO bars (symbol, interval, ts, open, high, low, close, volume) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for bar in bars {
                bar.validate()?;
                stmt.execute(params![
                    symbol,
                    bar.interval,
                    bar.timestamp.to_rfc3339(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume
                ])?;
            }
        }
        tx.commit()?;
        Ok(bars.len())
    }

    async fn read_history(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, AppError> {
        let symbol = canonicalize(symbol);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, interval, ts, open, high, low, close, volume FROM bars \
             WHERE symbol = ?1 AND interval = ?2 AND ts >= ?3 AND ts <= ?4 ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(
            params![symbol, interval.as_str(), start.to_rfc3339(), end.to_rfc3339()],
            row_to_bar,
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn get_latest(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        let symbol = canonicalize(symbol);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ts FROM bars WHERE symbol = ?1 AND interval = ?2 ORDER BY ts DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![symbol, interval.as_str()])?;
        if let Some(row) = rows.next()? {
            let ts: String = row.get(0)?;
            Ok(DateTime::parse_from_rfc3339(&ts)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)))
        } else {
            Ok(None)
        }
    }

    async fn symbols(&self) -> Result<Vec<String>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT symbol FROM bars ORDER BY symbol ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn record_count(&self, symbol: &str, interval: Interval) -> Result<u64, AppError> {
        let symbol = canonicalize(symbol);
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bars WHERE symbol = ?1 AND interval = ?2",
            params![symbol, interval.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn row_to_bar(row: &rusqlite::Row) -> rusqlite::Result<Bar> {
    let ts: String = row.get(2)?;
    let timestamp = DateTime::parse_from_rfc3339(&ts)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Ok(Bar {
        symbol: row.get(0)?,
        interval: row.get(1)?,
        timestamp,
        open: row.get(3)?,
        high: row.get(4)?,
        low: row.get(5)?,
        close: row.get(6)?,
        volume: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteBarStore {
        SqliteBarStore::open(":memory:").unwrap()
    }

    fn bar(ts: DateTime<Utc>, close: f64) -> Bar {
        Bar::new("AAPL", Interval::Day1, ts, close, close + 1.0, close - 1.0, close, 100.0).unwrap()
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let store = store();
        let t0 = Utc::now();
        store.write_bars(&[bar(t0, 10.0)]).await.unwrap();
        let got = store
            .read_history("AAPL", Interval::Day1, t0 - chrono::Duration::days(1), t0 + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].close, 10.0);
    }

    #[tokio::test]
    async fn overwrite_range_replaces_rows() {
        let store = store();
        let t0 = Utc::now();
        store.write_bars(&[bar(t0, 10.0)]).await.unwrap();
        store
            .overwrite_range(
                "AAPL",
                Interval::Day1,
                t0 - chrono::Duration::hours(1),
                t0 + chrono::Duration::hours(1),
                &[bar(t0, 20.0)],
            )
            .await
            .unwrap();
        let got = store
            .read_history("AAPL", Interval::Day1, t0 - chrono::Duration::days(1), t0 + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].close, 20.0);
    }

    #[tokio::test]
    async fn get_latest_tracks_max_timestamp() {
        let store = store();
        let t0 = Utc::now();
        store
            .write_bars(&[bar(t0, 10.0), bar(t0 + chrono::Duration::days(1), 11.0)])
            .await
            .unwrap();
        let latest = store.get_latest("AAPL", Interval::Day1).await.unwrap().unwrap();
        assert_eq!(latest, (t0 + chrono::Duration::days(1)));
    }
}

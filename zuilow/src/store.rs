//! SQLite-backed store: `signals`, `job_history` (spec.md §6.5).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quant_core::AppError;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS signals (
    id TEXT PRIMARY KEY,
    job_name TEXT NOT NULL,
    account TEXT NOT NULL,
    market TEXT,
    kind TEXT NOT NULL,
    symbol TEXT,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    trigger_at TEXT,
    executed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_signals_account_market_status ON signals(account, market, status);
CREATE INDEX IF NOT EXISTS idx_signals_trigger_at ON signals(trigger_at);

CREATE TABLE IF NOT EXISTS job_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_name TEXT NOT NULL,
    trigger_time TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    status TEXT NOT NULL,
    signals_count INTEGER NOT NULL DEFAULT 0,
    signals TEXT,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_job_history_job_name ON job_history(job_name, start_time DESC);
"#;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    Order,
    Rebalance,
    Allocation,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Order => "ORDER",
            SignalKind::Rebalance => "REBALANCE",
            SignalKind::Allocation => "ALLOCATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ORDER" => Some(SignalKind::Order),
            "REBALANCE" => Some(SignalKind::Rebalance),
            "ALLOCATION" => Some(SignalKind::Allocation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalStatus {
    Pending,
    Executed,
    Failed,
    Cancelled,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Pending => "PENDING",
            SignalStatus::Executed => "EXECUTED",
            SignalStatus::Failed => "FAILED",
            SignalStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TradingSignal {
    pub id: String,
    pub job_name: String,
    pub account: String,
    pub market: Option<String>,
    pub kind: String,
    pub symbol: Option<String>,
    pub payload: Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub trigger_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone)]
pub struct SignalFilters {
    pub account: Option<String>,
    pub market: Option<String>,
    pub status: Option<String>,
    pub kind: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobHistoryRow {
    pub id: i64,
    pub job_name: String,
    pub trigger_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: String,
    pub signals_count: i64,
    pub error: Option<String>,
}

pub struct ZuiLowStore {
    pub(crate) conn: Mutex<Connection>,
}

impl ZuiLowStore {
    pub fn open(path: &str) -> Result<Self, AppError> {
        let conn = Connection::open(path)
            .map_err(|e| AppError::StoreUnreachable(format!("open {path}: {e}")))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn insert_signal(&self, s: &TradingSignal) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO signals (id, job_name, account, market, kind, symbol, payload, status, created_at, trigger_at, executed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                s.id, s.job_name, s.account, s.market, s.kind, s.symbol,
                s.payload.to_string(), s.status, s.created_at.to_rfc3339(),
                s.trigger_at.map(|t| t.to_rfc3339()), s.executed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<TradingSignal>, AppError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, job_name, account, market, kind, symbol, payload, status, created_at, trigger_at, executed_at \
             FROM signals WHERE id = ?1",
            params![id],
            row_to_signal,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// `PENDING → {EXECUTED, FAILED, CANCELLED}` only; no backward transitions
    /// (spec.md §4.5).
    pub fn update_status(
        &self,
        id: &str,
        status: SignalStatus,
        executed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, AppError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE signals SET status = ?1, executed_at = ?2 WHERE id = ?3 AND status = 'PENDING'",
            params![status.as_str(), executed_at.map(|t| t.to_rfc3339()), id],
        )?;
        Ok(changed > 0)
    }

    /// Idempotent no-op when the row is unknown or already terminal.
    pub fn cancel(&self, id: &str) -> Result<bool, AppError> {
        self.update_status(id, SignalStatus::Cancelled, None)
    }

    pub fn list_pending(
        &self,
        account: Option<&str>,
        market: Option<&str>,
        trigger_at_before: DateTime<Utc>,
    ) -> Result<Vec<TradingSignal>, AppError> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, job_name, account, market, kind, symbol, payload, status, created_at, trigger_at, executed_at \
             FROM signals WHERE status = 'PENDING' AND (trigger_at IS NULL OR trigger_at <= ?1)",
        );
        let mut idx = 2;
        if account.is_some() {
            sql.push_str(&format!(" AND account = ?{idx}"));
            idx += 1;
        }
        if market.is_some() {
            sql.push_str(&format!(" AND market = ?{idx}"));
        }
        sql.push_str(" ORDER BY created_at ASC");
        let mut stmt = conn.prepare(&sql)?;
        let trigger_str = trigger_at_before.to_rfc3339();
        let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&trigger_str];
        if let Some(a) = &account {
            bound.push(a);
        }
        if let Some(m) = &market {
            bound.push(m);
        }
        let rows = stmt.query_map(bound.as_slice(), row_to_signal)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn list_signals(&self, filters: &SignalFilters, offset: i64, limit: i64) -> Result<Vec<TradingSignal>, AppError> {
        let conn = self.conn.lock();
        let (where_clause, bound) = build_filter_clause(filters);
        let sql = format!(
            "SELECT id, job_name, account, market, kind, symbol, payload, status, created_at, trigger_at, executed_at \
             FROM signals {where_clause} ORDER BY created_at DESC LIMIT ?{n1} OFFSET ?{n2}",
            n1 = bound.len() + 1,
            n2 = bound.len() + 2,
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut params: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
        params.push(&limit);
        params.push(&offset);
        let rows = stmt.query_map(params.as_slice(), row_to_signal)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn count_signals(&self, filters: &SignalFilters) -> Result<i64, AppError> {
        let conn = self.conn.lock();
        let (where_clause, bound) = build_filter_clause(filters);
        let sql = format!("SELECT COUNT(*) FROM signals {where_clause}");
        let params: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
        conn.query_row(&sql, params.as_slice(), |row| row.get(0))
            .map_err(AppError::from)
    }

    pub fn record_job_start(&self, job_name: &str, trigger_time: DateTime<Utc>, start: DateTime<Utc>) -> Result<i64, AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO job_history (job_name, trigger_time, start_time, status, signals_count) VALUES (?1, ?2, ?3, 'running', 0)",
            params![job_name, trigger_time.to_rfc3339(), start.to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn record_job_end(
        &self,
        id: i64,
        end: DateTime<Utc>,
        status: &str,
        signals_count: i64,
        signals: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE job_history SET end_time = ?1, status = ?2, signals_count = ?3, signals = ?4, error = ?5 WHERE id = ?6",
            params![
                end.to_rfc3339(), status, signals_count,
                signals.map(|v| v.to_string()), error, id
            ],
        )?;
        Ok(())
    }

    pub fn job_history(&self, job_name: Option<&str>, limit: i64) -> Result<Vec<JobHistoryRow>, AppError> {
        let conn = self.conn.lock();
        let (sql, use_filter) = match job_name {
            Some(_) => (
                "SELECT id, job_name, trigger_time, start_time, end_time, status, signals_count, error \
                 FROM job_history WHERE job_name = ?1 ORDER BY start_time DESC LIMIT ?2",
                true,
            ),
            None => (
                "SELECT id, job_name, trigger_time, start_time, end_time, status, signals_count, error \
                 FROM job_history ORDER BY start_time DESC LIMIT ?1",
                false,
            ),
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = if use_filter {
            stmt.query_map(params![job_name.unwrap(), limit], row_to_job_history)?
        } else {
            stmt.query_map(params![limit], row_to_job_history)?
        };
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

fn build_filter_clause(f: &SignalFilters) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut clauses = Vec::new();
    let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(a) = &f.account {
        clauses.push("account = ?".to_string());
        bound.push(Box::new(a.clone()));
    }
    if let Some(m) = &f.market {
        clauses.push("market = ?".to_string());
        bound.push(Box::new(m.clone()));
    }
    if let Some(s) = &f.status {
        clauses.push("status = ?".to_string());
        bound.push(Box::new(s.clone()));
    }
    if let Some(k) = &f.kind {
        clauses.push("kind = ?".to_string());
        bound.push(Box::new(k.clone()));
    }
    if let Some(d) = &f.date_from {
        clauses.push("created_at >= ?".to_string());
        bound.push(Box::new(d.to_rfc3339()));
    }
    if let Some(d) = &f.date_to {
        clauses.push("created_at <= ?".to_string());
        bound.push(Box::new(d.to_rfc3339()));
    }
    // Rebuild with positional placeholders since SQLite needs ?N when mixed
    // with a trailing LIMIT/OFFSET pair appended by the caller.
    let mut sql = String::new();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        for (i, c) in clauses.iter().enumerate() {
            if i > 0 {
                sql.push_str(" AND ");
            }
            sql.push_str(&c.replace('?', &format!("?{}", i + 1)));
        }
    }
    (sql, bound)
}

fn row_to_signal(row: &rusqlite::Row) -> rusqlite::Result<TradingSignal> {
    let created_at: String = row.get(8)?;
    let trigger_at: Option<String> = row.get(9)?;
    let executed_at: Option<String> = row.get(10)?;
    let payload: String = row.get(6)?;
    Ok(TradingSignal {
        id: row.get(0)?,
        job_name: row.get(1)?,
        account: row.get(2)?,
        market: row.get(3)?,
        kind: row.get(4)?,
        symbol: row.get(5)?,
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        status: row.get(7)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        trigger_at: trigger_at.and_then(|t| DateTime::parse_from_rfc3339(&t).ok()).map(|dt| dt.with_timezone(&Utc)),
        executed_at: executed_at.and_then(|t| DateTime::parse_from_rfc3339(&t).ok()).map(|dt| dt.with_timezone(&Utc)),
    })
}

fn row_to_job_history(row: &rusqlite::Row) -> rusqlite::Result<JobHistoryRow> {
    let trigger_time: String = row.get(2)?;
    let start_time: String = row.get(3)?;
    let end_time: Option<String> = row.get(4)?;
    Ok(JobHistoryRow {
        id: row.get(0)?,
        job_name: row.get(1)?,
        trigger_time: DateTime::parse_from_rfc3339(&trigger_time).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
        start_time: DateTime::parse_from_rfc3339(&start_time).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
        end_time: end_time.and_then(|t| DateTime::parse_from_rfc3339(&t).ok()).map(|dt| dt.with_timezone(&Utc)),
        status: row.get(5)?,
        signals_count: row.get(6)?,
        error: row.get(7)?,
    })
}

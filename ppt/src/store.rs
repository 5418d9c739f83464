//! SQLite-backed account store: accounts, positions, orders, trades,
//! equity_history, watchlist, current_account (spec.md §6.5).

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use quant_core::AppError;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS accounts (
    name TEXT PRIMARY KEY,
    initial_capital REAL NOT NULL,
    cash REAL NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS positions (
    account TEXT NOT NULL,
    symbol TEXT NOT NULL,
    qty REAL NOT NULL,
    avg_price REAL NOT NULL,
    current_price REAL,
    PRIMARY KEY (account, symbol)
);

CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    account TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    requested_qty REAL NOT NULL,
    filled_qty REAL NOT NULL,
    requested_price REAL,
    exec_price REAL NOT NULL,
    status TEXT NOT NULL,
    source TEXT NOT NULL,
    time TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_account_time ON orders(account, time DESC);

CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    account TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    qty REAL NOT NULL,
    price REAL NOT NULL,
    commission REAL NOT NULL,
    slippage_cost REAL NOT NULL,
    realized_pnl REAL NOT NULL,
    time TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trades_account_time ON trades(account, time DESC);

CREATE TABLE IF NOT EXISTS equity_history (
    account TEXT NOT NULL,
    date TEXT NOT NULL,
    equity REAL NOT NULL,
    pnl REAL NOT NULL,
    pnl_pct REAL NOT NULL,
    PRIMARY KEY (account, date)
);

CREATE TABLE IF NOT EXISTS watchlist (
    account TEXT NOT NULL,
    symbol TEXT NOT NULL,
    last_price REAL NOT NULL,
    PRIMARY KEY (account, symbol)
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const CURRENT_ACCOUNT_KEY: &str = "current_account";

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub name: String,
    pub initial_capital: f64,
    pub cash: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub qty: f64,
    pub avg_price: f64,
    pub current_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: String,
    pub account: String,
    pub symbol: String,
    pub side: String,
    pub requested_qty: f64,
    pub filled_qty: f64,
    pub requested_price: Option<f64>,
    pub exec_price: f64,
    pub status: String,
    pub source: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub id: String,
    pub account: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub price: f64,
    pub commission: f64,
    pub slippage_cost: f64,
    pub realized_pnl: f64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EquityPoint {
    pub account: String,
    pub date: NaiveDate,
    pub equity: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
}

pub struct PptStore {
    pub(crate) conn: Mutex<Connection>,
}

impl PptStore {
    pub fn open(path: &str) -> Result<Self, AppError> {
        let conn = Connection::open(path)
            .map_err(|e| AppError::StoreUnreachable(format!("open {path}: {e}")))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn create_account(&self, name: &str, initial_capital: f64, created_at: DateTime<Utc>) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO accounts (name, initial_capital, cash, created_at) VALUES (?1, ?2, ?2, ?3)",
            params![name, initial_capital, created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_account(&self, name: &str) -> Result<Option<Account>, AppError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT name, initial_capital, cash, created_at FROM accounts WHERE name = ?1",
            params![name],
            |row| {
                let created_at: String = row.get(3)?;
                Ok(Account {
                    name: row.get(0)?,
                    initial_capital: row.get(1)?,
                    cash: row.get(2)?,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, initial_capital, cash, created_at FROM accounts ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let created_at: String = row.get(3)?;
            Ok(Account {
                name: row.get(0)?,
                initial_capital: row.get(1)?,
                cash: row.get(2)?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn delete_account(&self, name: &str) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM accounts WHERE name = ?1", params![name])?;
        conn.execute("DELETE FROM positions WHERE account = ?1", params![name])?;
        conn.execute("DELETE FROM orders WHERE account = ?1", params![name])?;
        conn.execute("DELETE FROM trades WHERE account = ?1", params![name])?;
        conn.execute("DELETE FROM equity_history WHERE account = ?1", params![name])?;
        conn.execute("DELETE FROM watchlist WHERE account = ?1", params![name])?;
        Ok(())
    }

    pub fn reset_account(&self, name: &str, new_initial_capital: Option<f64>) -> Result<(), AppError> {
        let conn = self.conn.lock();
        let capital: f64 = match new_initial_capital {
            Some(c) => c,
            None => conn.query_row(
                "SELECT initial_capital FROM accounts WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?,
        };
        conn.execute(
            "UPDATE accounts SET cash = ?1, initial_capital = ?1 WHERE name = ?2",
            params![capital, name],
        )?;
        conn.execute("DELETE FROM positions WHERE account = ?1", params![name])?;
        conn.execute("DELETE FROM orders WHERE account = ?1", params![name])?;
        conn.execute("DELETE FROM trades WHERE account = ?1", params![name])?;
        conn.execute("DELETE FROM equity_history WHERE account = ?1", params![name])?;
        Ok(())
    }

    pub fn set_cash(&self, name: &str, cash: f64) -> Result<(), AppError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE accounts SET cash = ?1 WHERE name = ?2",
            params![cash, name],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("account '{name}'")));
        }
        Ok(())
    }

    pub fn set_current_account(&self, name: &str) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![CURRENT_ACCOUNT_KEY, name],
        )?;
        Ok(())
    }

    pub fn current_account(&self) -> Result<Option<String>, AppError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![CURRENT_ACCOUNT_KEY],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn get_position(&self, account: &str, symbol: &str) -> Result<Option<Position>, AppError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT symbol, qty, avg_price, current_price FROM positions WHERE account = ?1 AND symbol = ?2",
            params![account, symbol],
            |row| {
                Ok(Position {
                    symbol: row.get(0)?,
                    qty: row.get(1)?,
                    avg_price: row.get(2)?,
                    current_price: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_positions(&self, account: &str) -> Result<Vec<Position>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, qty, avg_price, current_price FROM positions WHERE account = ?1 ORDER BY symbol ASC",
        )?;
        let rows = stmt.query_map(params![account], |row| {
            Ok(Position {
                symbol: row.get(0)?,
                qty: row.get(1)?,
                avg_price: row.get(2)?,
                current_price: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn list_orders(&self, account: &str, limit: i64) -> Result<Vec<Order>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account, symbol, side, requested_qty, filled_qty, requested_price, exec_price, status, source, time \
             FROM orders WHERE account = ?1 ORDER BY time DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![account, limit], row_to_order)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn list_trades(&self, account: &str, limit: i64) -> Result<Vec<Trade>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account, symbol, side, qty, price, commission, slippage_cost, realized_pnl, time \
             FROM trades WHERE account = ?1 ORDER BY time DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![account, limit], row_to_trade)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn list_equity(&self, account: &str) -> Result<Vec<EquityPoint>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT account, date, equity, pnl, pnl_pct FROM equity_history WHERE account = ?1 ORDER BY date ASC",
        )?;
        let rows = stmt.query_map(params![account], row_to_equity)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn set_watchlist_price(&self, account: &str, symbol: &str, price: f64) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO watchlist (account, symbol, last_price) VALUES (?1, ?2, ?3) \
             ON CONFLICT(account, symbol) DO UPDATE SET last_price = excluded.last_price",
            params![account, symbol, price],
        )?;
        Ok(())
    }

    pub fn watchlist_price(&self, account: &str, symbol: &str) -> Result<Option<f64>, AppError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT last_price FROM watchlist WHERE account = ?1 AND symbol = ?2",
            params![account, symbol],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn upsert_equity_point(&self, point: &EquityPoint) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO equity_history (account, date, equity, pnl, pnl_pct) VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(account, date) DO UPDATE SET equity = excluded.equity, pnl = excluded.pnl, pnl_pct = excluded.pnl_pct",
            params![point.account, point.date.to_string(), point.equity, point.pnl, point.pnl_pct],
        )?;
        Ok(())
    }
}

fn row_to_order(row: &rusqlite::Row) -> rusqlite::Result<Order> {
    let time: String = row.get(10)?;
    Ok(Order {
        id: row.get(0)?,
        account: row.get(1)?,
        symbol: row.get(2)?,
        side: row.get(3)?,
        requested_qty: row.get(4)?,
        filled_qty: row.get(5)?,
        requested_price: row.get(6)?,
        exec_price: row.get(7)?,
        status: row.get(8)?,
        source: row.get(9)?,
        time: DateTime::parse_from_rfc3339(&time)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<Trade> {
    let time: String = row.get(9)?;
    Ok(Trade {
        id: row.get(0)?,
        account: row.get(1)?,
        symbol: row.get(2)?,
        side: row.get(3)?,
        qty: row.get(4)?,
        price: row.get(5)?,
        commission: row.get(6)?,
        slippage_cost: row.get(7)?,
        realized_pnl: row.get(8)?,
        time: DateTime::parse_from_rfc3339(&time)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_equity(row: &rusqlite::Row) -> rusqlite::Result<EquityPoint> {
    let date: String = row.get(1)?;
    Ok(EquityPoint {
        account: row.get(0)?,
        date: date.parse().unwrap_or_else(|_| Utc::now().date_naive()),
        equity: row.get(2)?,
        pnl: row.get(3)?,
        pnl_pct: row.get(4)?,
    })
}

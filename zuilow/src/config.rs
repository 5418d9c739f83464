//! ZuiLow service configuration, loaded from the environment.
//!
//! Mirrors `dms::config::Config` / `ppt::config::Config`; no YAML or generic
//! env-parsing layer (spec.md §1). Markets and account-to-broker-type
//! mappings are expressed as small comma-separated env vars rather than a
//! config file, same spirit as the teacher's flat `.env`-driven `Config`.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub code: String,
    pub timezone: String,
    pub open_time: String,
    pub close_time: String,
    pub bar_minutes: i64,
    pub enabled: bool,
}

fn known_markets() -> Vec<MarketConfig> {
    vec![
        MarketConfig {
            code: "US".into(),
            timezone: "America/New_York".into(),
            open_time: "09:30".into(),
            close_time: "16:00".into(),
            bar_minutes: 5,
            enabled: false,
        },
        MarketConfig {
            code: "HK".into(),
            timezone: "Asia/Hong_Kong".into(),
            open_time: "09:30".into(),
            close_time: "16:00".into(),
            bar_minutes: 5,
            enabled: false,
        },
    ]
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub worker_pool_size: usize,
    pub tick_interval_secs: u64,
    pub default_account: String,
    /// Broker type used for `/api/order` when `account` is omitted.
    pub default_mode: String,
    pub default_qty: f64,
    pub ppt_url: String,
    pub futu_url: Option<String>,
    pub ibkr_url: Option<String>,
    pub webhook_token: Option<String>,
    /// `account name -> broker type ("paper"|"futu"|"ibkr")`.
    pub accounts: HashMap<String, String>,
    pub markets: Vec<MarketConfig>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let default_account = std::env::var("ZUILOW_DEFAULT_ACCOUNT").unwrap_or_else(|_| "default".to_string());
        let default_mode = std::env::var("ZUILOW_DEFAULT_MODE").unwrap_or_else(|_| "paper".to_string());

        let mut accounts = HashMap::new();
        accounts.insert(default_account.clone(), default_mode.clone());
        if let Ok(raw) = std::env::var("ZUILOW_ACCOUNTS") {
            for pair in raw.split(',') {
                if let Some((name, kind)) = pair.split_once(':') {
                    accounts.insert(name.trim().to_string(), kind.trim().to_string());
                }
            }
        }

        let enabled_markets: Vec<String> = std::env::var("ZUILOW_MARKETS")
            .unwrap_or_else(|_| "US".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        let markets = known_markets()
            .into_iter()
            .map(|mut m| {
                m.enabled = enabled_markets.contains(&m.code);
                m
            })
            .collect();

        Ok(Self {
            database_path: std::env::var("ZUILOW_DATABASE_PATH").unwrap_or_else(|_| "./zuilow.db".to_string()),
            port: env_parse("ZUILOW_PORT", 11190u16),
            worker_pool_size: env_parse("ZUILOW_WORKER_POOL_SIZE", 3usize),
            tick_interval_secs: env_parse("ZUILOW_TICK_INTERVAL_SECS", 30u64),
            default_account,
            default_mode,
            default_qty: env_parse("ZUILOW_DEFAULT_QTY", 10.0f64),
            ppt_url: std::env::var("ZUILOW_PPT_URL").unwrap_or_else(|_| "http://localhost:11180".to_string()),
            futu_url: std::env::var("ZUILOW_FUTU_URL").ok(),
            ibkr_url: std::env::var("ZUILOW_IBKR_URL").ok(),
            webhook_token: std::env::var("ZUILOW_WEBHOOK_TOKEN").ok(),
            accounts,
            markets,
        })
    }

    pub fn broker_type_for(&self, account: &str) -> Option<&str> {
        self.accounts.get(account).map(|s| s.as_str())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

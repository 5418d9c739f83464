//! PPT service configuration, loaded from the environment.
//!
//! YAML loading and a generic env-parsing layer are out of scope
//! (spec.md §1); mirrors `dms::config::Config` and the teacher's
//! `models::Config::from_env`.

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub default_account: String,
    pub default_initial_capital: f64,
    pub commission_rate: f64,
    pub min_commission: f64,
    pub slippage: f64,
    /// Fraction of `requested_qty` filled when the fill-rate model isn't a
    /// full fill; `1.0` means always fill completely.
    pub fill_rate: f64,
    pub webhook_token: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            database_path: std::env::var("PPT_DATABASE_PATH").unwrap_or_else(|_| "./ppt.db".to_string()),
            port: env_parse("PPT_PORT", 11180u16),
            default_account: std::env::var("PPT_DEFAULT_ACCOUNT").unwrap_or_else(|_| "default".to_string()),
            default_initial_capital: env_parse("PPT_DEFAULT_INITIAL_CAPITAL", 100_000.0f64),
            commission_rate: env_parse("PPT_COMMISSION_RATE", 0.001f64),
            min_commission: env_parse("PPT_MIN_COMMISSION", 1.0f64),
            slippage: env_parse("PPT_SLIPPAGE", 0.0f64),
            fill_rate: env_parse("PPT_FILL_RATE", 1.0f64),
            webhook_token: std::env::var("PPT_WEBHOOK_TOKEN").ok(),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

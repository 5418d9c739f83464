//! Stime service configuration.
//!
//! `tick_urls` and `zuilow_tick_timeout` are mutable at runtime through
//! `GET/POST /config` (spec.md §6.4) on top of the env-loaded defaults;
//! like the other services, no YAML layer (spec.md §1) — env vars with
//! typed fallbacks are the supported path.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub tick_urls: Vec<String>,
    pub zuilow_tick_timeout: Duration,
    pub webhook_token: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let tick_urls = std::env::var("STIME_TICK_URLS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            port: env_parse("STIME_PORT", 11160u16),
            tick_urls,
            zuilow_tick_timeout: Duration::from_secs(env_parse("STIME_TICK_TIMEOUT_SECS", 600u64)),
            webhook_token: std::env::var("STIME_WEBHOOK_TOKEN").ok(),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

use std::time::Duration;

/// DMS service configuration, loaded from the environment.
///
/// YAML loading and a generic env-parsing layer are out of scope
/// (spec.md §1); like the teacher's `models::Config::from_env`, this reads
/// `std::env` directly with typed fallbacks.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub role: String,
    pub fan_out_pool_size: usize,
    pub retry_times: u32,
    pub retry_delay: Duration,
    pub gap_threshold_days: i64,
    pub initial_days: i64,
    pub check_range_days: i64,
    pub max_price_change: f64,
    pub repair_threshold_pct: f64,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub webhook_token: Option<String>,
    pub backup_urls: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DMS_DATABASE_PATH").unwrap_or_else(|_| "./dms.db".to_string());
        let port = env_parse("DMS_PORT", 11170u16);
        let role = std::env::var("DMS_ROLE").unwrap_or_else(|_| "master".to_string());
        let fan_out_pool_size = env_parse("DMS_FANOUT_POOL_SIZE", 5usize);
        let retry_times = env_parse("DMS_RETRY_TIMES", 3u32);
        let retry_delay = Duration::from_secs(env_parse("DMS_RETRY_DELAY_SECS", 1u64));
        let gap_threshold_days = env_parse("DMS_GAP_THRESHOLD_DAYS", 5i64);
        let initial_days = env_parse("DMS_INITIAL_DAYS", 1825i64);
        let check_range_days = env_parse("DMS_CHECK_RANGE_DAYS", 30i64);
        let max_price_change = env_parse("DMS_MAX_PRICE_CHANGE", 0.5f64);
        let repair_threshold_pct = env_parse("DMS_REPAIR_THRESHOLD_PCT", 0.01f64);
        let cache_capacity = env_parse("DMS_CACHE_CAPACITY", 256usize);
        let cache_ttl = Duration::from_secs(env_parse("DMS_CACHE_TTL_SECS", 60u64));
        let webhook_token = std::env::var("DMS_WEBHOOK_TOKEN").ok();
        let backup_urls = std::env::var("DMS_BACKUP_URLS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_path,
            port,
            role,
            fan_out_pool_size,
            retry_times,
            retry_delay,
            gap_threshold_days,
            initial_days,
            check_range_days,
            max_price_change,
            repair_threshold_pct,
            cache_capacity,
            cache_ttl,
            webhook_token,
            backup_urls,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

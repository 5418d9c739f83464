//! DMS binary entrypoint: loads config, opens the primary BarStore,
//! starts the task dispatcher loop and serves the `/api/dms` HTTP surface.

use std::sync::Arc;
use std::time::Instant;

use quant_core::{Clock, Fetcher, SyntheticFetcher};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dms::api::{self, AppState};
use dms::cache::ReadCache;
use dms::config::Config;
use dms::scheduler::{Scheduler, TaskDef, Trigger};
use dms::store::SqliteBarStore;
use dms::tasks::TaskKind;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dms=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn default_tasks() -> Vec<TaskDef> {
    vec![
        TaskDef {
            name: "incremental_daily".into(),
            kind: TaskKind::Incremental,
            symbols: vec!["AAPL".into(), "MSFT".into()],
            interval: quant_core::Interval::Day1,
            trigger: Trigger::Cron("0 0 17 * * *".into()),
            enabled: true,
        },
        TaskDef {
            name: "validation_daily".into(),
            kind: TaskKind::Validation,
            symbols: vec!["AAPL".into(), "MSFT".into()],
            interval: quant_core::Interval::Day1,
            trigger: Trigger::Cron("0 30 17 * * *".into()),
            enabled: true,
        },
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    info!(port = config.port, role = %config.role, "starting DMS");

    // Connection failure to the primary store on startup is fatal
    // (spec.md §7 `store_unreachable` primary).
    let store = Arc::new(SqliteBarStore::open(&config.database_path)?);
    info!(path = %config.database_path, "BarStore opened");

    let fetcher: Arc<dyn Fetcher> = Arc::new(SyntheticFetcher::default());
    let clock = Clock::new();
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        fetcher.clone(),
        clock.clone(),
        config.clone(),
        default_tasks(),
    ));

    let replication = scheduler.replication.clone();
    let cache = Arc::new(ReadCache::new(config.cache_capacity, config.cache_ttl));

    let state = Arc::new(AppState {
        store: store.clone(),
        scheduler: scheduler.clone(),
        replication,
        cache,
        config: config.clone(),
        started_at: Instant::now(),
    });

    tokio::spawn(scheduler.clone().run_loop());

    let app = api::router(state).layer(CorsLayer::permissive());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "DMS listening");
    axum::serve(listener, app).await?;

    Ok(())
}

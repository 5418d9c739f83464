//! ZuiLow binary entrypoint: loads config, opens the signal/job-history
//! store, wires the broker registry and executor, registers the built-in
//! strategies, starts the trigger loop and serves the `/api` HTTP surface.

use std::sync::Arc;

use quant_core::{Clock, Fetcher, LoggingNotifier, SyntheticFetcher};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zuilow::api::{self, AppState};
use zuilow::broker::{BrokerGateway, HttpStubGateway, PaperGateway};
use zuilow::config::Config;
use zuilow::executor::{BrokerRegistry, SignalExecutor};
use zuilow::scheduler::Scheduler;
use zuilow::signal_store::SignalStore;
use zuilow::store::ZuiLowStore;
use zuilow::strategies::{MovingAverageCrossoverFactory, RandomAllocationFactory};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zuilow=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    info!(port = config.port, "starting ZuiLow");

    let store = Arc::new(ZuiLowStore::open(&config.database_path)?);
    let signals = Arc::new(SignalStore::new(store.clone()));
    let clock = Clock::new();

    let fetcher: Arc<dyn Fetcher> = Arc::new(SyntheticFetcher::default());

    let mut registry = BrokerRegistry::new();
    let paper: Arc<dyn BrokerGateway> = Arc::new(PaperGateway::new(
        config.ppt_url.clone(),
        config.webhook_token.clone(),
        fetcher.clone(),
    ));
    registry.register("paper", paper);
    if config.futu_url.is_some() {
        registry.register("futu", Arc::new(HttpStubGateway::new("futu", config.futu_url.clone())));
    }
    if config.ibkr_url.is_some() {
        registry.register("ibkr", Arc::new(HttpStubGateway::new("ibkr", config.ibkr_url.clone())));
    }
    let brokers = Arc::new(registry);

    let executor = Arc::new(SignalExecutor::new(signals.clone(), brokers.clone(), config.clone()));
    let notifier = Arc::new(LoggingNotifier);

    let scheduler = Arc::new(Scheduler::new(
        clock,
        config.clone(),
        store.clone(),
        signals.clone(),
        executor.clone(),
        brokers.clone(),
        notifier,
    ));
    scheduler.register_strategy(
        "moving_average_crossover",
        Arc::new(MovingAverageCrossoverFactory { short_window: 5, long_window: 20 }),
    );
    scheduler.register_strategy(
        "random_allocation",
        Arc::new(RandomAllocationFactory {
            pool: vec![
                "US.AAPL".into(), "US.GOOGL".into(), "US.MSFT".into(), "US.AMD".into(),
                "US.TSLA".into(), "US.NVDA".into(), "US.META".into(), "US.AMZN".into(),
            ],
            pick_count: 5,
        }),
    );

    tokio::spawn(scheduler.clone().run_loop());

    let state = Arc::new(AppState {
        scheduler,
        signals,
        executor,
        brokers,
        config: config.clone(),
    });

    let app = api::router(state).layer(CorsLayer::permissive());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "ZuiLow listening");
    axum::serve(listener, app).await?;

    Ok(())
}

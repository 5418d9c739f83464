//! PPT binary entrypoint: loads config, opens the account store, ensures
//! the default account exists and serves the `/api` HTTP surface.

use std::sync::Arc;

use quant_core::{Clock, Fetcher, SyntheticFetcher};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ppt::api::{self, AppState};
use ppt::config::Config;
use ppt::paperbook::PaperBook;
use ppt::store::PptStore;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ppt=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    info!(port = config.port, "starting PPT");

    let store = Arc::new(PptStore::open(&config.database_path)?);
    let clock = Clock::new();

    if store.get_account(&config.default_account)?.is_none() {
        store.create_account(&config.default_account, config.default_initial_capital, clock.now())?;
        store.set_current_account(&config.default_account)?;
        info!(account = %config.default_account, "created default account");
    }

    let fetcher: Arc<dyn Fetcher> = Arc::new(SyntheticFetcher::default());
    let book = Arc::new(PaperBook::new(store.clone(), config.clone()));

    let state = Arc::new(AppState {
        store,
        book,
        fetcher,
        clock,
        config: config.clone(),
    });

    let app = api::router(state).layer(CorsLayer::permissive());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "PPT listening");
    axum::serve(listener, app).await?;

    Ok(())
}

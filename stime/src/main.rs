//! Stime binary entrypoint: starts a process-wide real-mode `Clock`, a
//! single-job sequential `SimDriver`, and serves the `/now` /`/set`
//! /`/advance` /`/advance-and-tick` HTTP surface.

use std::sync::Arc;

use parking_lot::RwLock;
use quant_core::Clock;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stime::api::{self, AppState};
use stime::config::Config;
use stime::driver::SimDriver;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stime=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    info!(port = config.port, "starting Stime");

    let clock = Clock::new();
    let driver = Arc::new(SimDriver::new(clock.clone()));

    let state = Arc::new(AppState {
        clock,
        driver,
        config: RwLock::new(config.clone()),
    });

    let app = api::router(state).layer(CorsLayer::permissive());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "Stime listening");
    axum::serve(listener, app).await?;

    Ok(())
}

mod api;
mod config;
mod db;
mod error;
mod fetcher;
mod normalizer;
mod query;
mod refresh;
mod scorer;
mod state;
mod types;

#[cfg(test)]
mod testkit;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::api::routes::{router, ApiState};
use crate::config::Config;
use crate::db::SqliteStore;
use crate::error::Result;
use crate::fetcher::HttpCompSource;
use crate::refresh::{RefreshOrchestrator, RefreshSettings, WatchlistRefresher};
use crate::state::{ValuationCache, WatchlistRegistry};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database + cache hydration ---
    let store = SqliteStore::connect(&cfg.db_path).await?;
    let cache = ValuationCache::new(store.clone());
    cache.hydrate().await?;
    let registry = WatchlistRegistry::new(store);

    // --- Comp acquisition ---
    let source = Arc::new(HttpCompSource::from_config(&cfg)?);
    info!(
        "Comp source: {} ({} page(s), timeout {}s), currency {}",
        cfg.comps_api_url,
        cfg.comps_pages,
        cfg.acquisition_timeout.as_secs(),
        cfg.currency,
    );

    let health = Arc::new(HealthState::new());
    let latency = Arc::new(LatencyStats::new()?);

    let orchestrator = RefreshOrchestrator::new(
        source,
        cache,
        RefreshSettings::from_config(&cfg),
        Arc::clone(&health),
        Arc::clone(&latency),
    );

    // Watchlist sweep (background, every WATCHLIST_REFRESH_INTERVAL_SECS)
    let refresher = WatchlistRefresher::new(
        Arc::clone(&orchestrator),
        Arc::clone(&registry),
        Arc::clone(&health),
        cfg.refresh_interval,
        cfg.sweep_max_concurrent,
    );
    let sweeper = Arc::clone(&refresher);
    tokio::spawn(async move { sweeper.run().await });
    info!(
        "Watchlist sweep every {}s, at most {} concurrent refreshes",
        cfg.refresh_interval.as_secs(),
        cfg.sweep_max_concurrent,
    );

    // HTTP API server
    let api_state = ApiState {
        orchestrator,
        registry,
        refresher,
        health,
        latency,
        max_age: cfg.valuation_max_age,
        thresholds: cfg.policy.deal,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

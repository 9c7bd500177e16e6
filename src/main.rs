mod api;
mod config;
mod db;
mod error;
mod query;
mod report;
mod types;

use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::api::routes::{router, ApiState};
use crate::config::{Config, CHANNEL_CAPACITY};
use crate::db::{DocumentStore, SqliteDocumentStore};
use crate::error::Result;
use crate::query::{QueryDispatcher, QueryHandler};
use crate::report::ids::OsReportIds;
use crate::report::ReportGenerator;

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
    // --- Database setup ---
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", cfg.db_path))?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .acquire_timeout(cfg.store_connection_timeout)
        .connect_with(options)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready at {}", cfg.db_path);

    let store: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::new(pool, cfg.store_timeout));
    let reports = Arc::new(ReportGenerator::new(Arc::clone(&store), Arc::new(OsReportIds), &cfg));
    let health = Arc::new(HealthState::new());
    let latency = Arc::new(LatencyStats::new());

    // --- Query dispatcher ---
    let (query_tx, query_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handler = Arc::new(QueryHandler::new(Arc::clone(&reports)));
    let dispatcher = QueryDispatcher::new(handler, query_rx, &cfg, Arc::clone(&health), Arc::clone(&latency));
    let dispatcher = tokio::spawn(dispatcher.run());

    // HTTP API server. The router owns the only sender, so stopping it closes the channel.
    let api_state = ApiState {
        service_name: cfg.service_name.clone(),
        store,
        reports,
        queries: query_tx,
        health,
        latency,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(
        service = %cfg.service_name,
        aggregate_id = cfg.aggregate_id,
        concurrency = cfg.query_concurrency,
        "HTTP API listening on {bind_addr}"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP API stopped, waiting for in-flight queries");
    if let Err(e) = dispatcher.await {
        error!("Query dispatcher failed: {e}");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}

//! Raffle Worker
//!
//! Long-running process that keeps the raffle consistent in the background.
//!
//! This binary:
//! - Connects to `PostgreSQL` and runs migrations
//! - Makes sure an ACTIVE raffle exists with its full ticket pool
//! - Serves Prometheus metrics
//! - Sweeps expired holds on an interval
//! - Reconciles stale PENDING sales against the payment gateway
//!
//! # Usage
//!
//! ```bash
//! # Start infrastructure
//! docker compose up -d
//!
//! # Run worker
//! cargo run --bin raffle-worker
//! ```

use anyhow::Context;
use raffle_core::environment::SystemClock;
use raffle_engine::{
    Config, ExpirySweepJob, HttpPaymentGateway, JobRunner, LogMailer, RaffleEngine,
    ResilientGateway, StaleReconcileJob,
};
use raffle_postgres::PostgresRaffleStore;
use raffle_runtime::CircuitBreaker;
use raffle_runtime::metrics::MetricsServer;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,raffle_engine=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting raffle worker...");

    let config = Config::from_env();
    tracing::info!(
        raffle = %config.raffle.name,
        max_number = config.raffle.max_number,
        gateway = %config.gateway.base_url,
        "Configuration loaded"
    );

    let metrics_addr: SocketAddr = format!("{}:{}", config.worker.metrics_host, config.worker.metrics_port)
        .parse()
        .context("invalid METRICS_HOST/METRICS_PORT")?;
    let mut metrics_server = MetricsServer::new(metrics_addr);
    metrics_server.start().context("failed to start metrics server")?;
    raffle_engine::metrics::register_business_metrics();

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout))
        .connect(&config.database.url)
        .await
        .context("failed to connect to PostgreSQL")?;
    let store = PostgresRaffleStore::from_pool(pool);
    store.migrate().await.context("failed to run migrations")?;
    tracing::info!("Database ready");

    let clock = Arc::new(SystemClock);
    let http = HttpPaymentGateway::new(config.gateway_config()).context("failed to build gateway client")?;
    let breaker = CircuitBreaker::new("payment_gateway", config.resilience.breaker_config(), clock.clone());
    let gateway = ResilientGateway::new(Arc::new(http), config.resilience.retry_policy(), breaker);

    let engine = RaffleEngine::new(
        Arc::new(store),
        Arc::new(gateway),
        Arc::new(LogMailer),
        clock,
        config.engine_settings(),
    );

    let raffle = engine
        .ensure_active_raffle()
        .await
        .context("failed to prepare the active raffle")?;
    let availability = engine.availability().await?;
    tracing::info!(
        raffle_id = %raffle.id,
        available = availability.available,
        reserved = availability.reserved,
        sold = availability.sold,
        "Active raffle ready"
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let handles = vec![
        JobRunner::new(
            Arc::new(ExpirySweepJob::new(engine.clone())),
            Duration::from_secs(config.worker.sweep_interval_secs),
            shutdown_tx.subscribe(),
        )
        .spawn(),
        JobRunner::new(
            Arc::new(StaleReconcileJob::new(engine.clone(), config.stale_pending_age())),
            Duration::from_secs(config.worker.reconcile_interval_secs),
            shutdown_tx.subscribe(),
        )
        .spawn(),
    ];

    tracing::info!("Raffle worker is running, press Ctrl+C to shut down");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down gracefully...");
    let _ = shutdown_tx.send(());
    let drain = futures::future::join_all(handles);
    if tokio::time::timeout(Duration::from_secs(config.worker.shutdown_timeout), drain)
        .await
        .is_err()
    {
        tracing::warn!("Jobs did not stop within the shutdown timeout");
    }

    tracing::info!("Raffle worker stopped");
    Ok(())
}

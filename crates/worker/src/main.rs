//! Worker binary: connects to PostgreSQL, wires the built-in actions and
//! runs the lease loop until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use playmill_store::{database_url_from_env, EngineStore, PgEngineStore, SecretCipher};
use playmill_worker::actions::ActionRegistry;
use playmill_worker::{WorkerConfig, WorkerRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("playmill_worker=info,playmill_store=info,info")),
        )
        .init();

    // Timestamps in events and leases compare across components; the
    // whole deployment runs in UTC.
    match std::env::var("TZ") {
        Ok(tz) if tz == "UTC" => {}
        other => tracing::warn!(tz = ?other.ok(), "TZ should be set to UTC on every component"),
    }

    let config = WorkerConfig::from_env();
    tracing::info!(
        worker_id = %config.worker_id,
        pool = %config.pool,
        runtime = ?config.runtime,
        slots = config.max_concurrency,
        "starting worker"
    );

    let database_url = database_url_from_env().context("database configuration")?;
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(&database_url)
        .await
        .context("failed to connect to PostgreSQL")?;

    let cipher = SecretCipher::from_env().context("SECRETS_ENCRYPTION_KEY")?;
    let store = Arc::new(PgEngineStore::new(pool, cipher));

    let registry = ActionRegistry::with_builtins(store.clone() as Arc<dyn EngineStore>);
    let runtime = Arc::new(WorkerRuntime::new(store, registry, config));

    let loop_handle = tokio::spawn(runtime.clone().run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    runtime.shutdown();

    loop_handle.await?.context("worker loop failed")?;
    Ok(())
}

//! Server binary: HTTP control plane plus the broker daemon and the lease
//! reaper, all on one process.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use playmill_server::services::{CatalogService, ExecutionService};
use playmill_server::{
    build_router, reaper_loop, AppState, BrokerDaemon, Composer, ServerConfig,
};
use playmill_store::{database_url_from_env, EngineStore, PgEngineStore, SecretCipher};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("playmill_server=info,playmill_store=info,tower_http=info,info")
            }),
        )
        .init();

    // Event ordering and lease expiry compare timestamps across
    // components; the whole deployment runs in UTC.
    match std::env::var("TZ") {
        Ok(tz) if tz == "UTC" => {}
        other => tracing::warn!(tz = ?other.ok(), "TZ should be set to UTC on every component"),
    }

    let config = ServerConfig::from_env();

    let database_url = database_url_from_env().context("database configuration")?;
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(&database_url)
        .await
        .context("failed to connect to PostgreSQL")?;

    let cipher = SecretCipher::from_env().context("SECRETS_ENCRYPTION_KEY")?;
    let pg_store = PgEngineStore::new(pool.clone(), cipher);
    pg_store.migrate().await.context("schema migration")?;
    tracing::info!("database ready");

    let store: Arc<dyn EngineStore> = Arc::new(pg_store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let catalog = CatalogService::new(store.clone());
    let executions = ExecutionService::new(store.clone());
    let composer = Composer::new(store.clone(), executions);
    let daemon = Arc::new(BrokerDaemon::new(
        store.clone(),
        catalog,
        composer,
        config.broker.clone(),
    ));
    let broker_handle = tokio::spawn(daemon.run(shutdown_rx.clone()));
    let reaper_handle = tokio::spawn(reaper_loop(
        store.clone(),
        config.broker.reap_interval,
        shutdown_rx,
    ));

    let state = AppState::new(store, Some(pool));
    let app = build_router(state);

    let addr = config.socket_addr().context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("http server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    let _ = broker_handle.await;
    reaper_handle.abort();
    Ok(())
}

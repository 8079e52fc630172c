use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use topup_api::{app, worker, AppState};
use topup_catalog::{CodeStore, InMemoryCodeStore};
use topup_store::{Config, DbClient, PgCodeStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "topup_api=debug,topup_order=debug,tower_http=debug,axum::rejection=trace".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!(
        "Starting top-up engine for tenant {} on port {}",
        config.tenant.id,
        config.server.port
    );

    let code_store: Arc<dyn CodeStore> = match &config.database {
        Some(db) => {
            let client = DbClient::new(&db.url)
                .await
                .context("Failed to connect to Postgres")?;
            client.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Using Postgres code store");
            Arc::new(PgCodeStore::new(client.pool.clone()))
        }
        None => {
            tracing::info!("No database configured, using in-memory code store");
            Arc::new(InMemoryCodeStore::new())
        }
    };

    let state = AppState::build(&config, code_store).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = tokio::spawn(worker::start_balance_worker(
        state.gateway.clone(),
        state.balances.clone(),
        config.dispatch.balance_poll_interval(),
        shutdown_rx,
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("Server error")?;

    poller.await.context("Balance worker panicked")?;
    Ok(())
}

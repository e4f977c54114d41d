// NoETL orchestrator server entrypoint.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use noetl_server::api::{self, AppState};
use noetl_server::engine::Scheduler;
use noetl_server::ServerConfig;
use noetl_storage::{PostgresStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "noetl_server=info,noetl_storage=info,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    info!(addr = %config.bind_addr(), shard = config.shard_index, "starting noetl server");

    let store = PostgresStore::connect(&config.database_url)
        .await
        .context("database connection failed")?;
    let store: Arc<dyn Store> = Arc::new(store);

    let scheduler = Arc::new(Scheduler::new(store, config.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_tick_loop(scheduler.clone(), shutdown_rx);

    let state = AppState::new(scheduler);
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .context("bind failed")?;
    info!("listening on {}", config.bind_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    Ok(())
}

/// Periodic maintenance: lease reaping and execution sweeps.
fn spawn_tick_loop(scheduler: Arc<Scheduler<dyn Store>>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = scheduler.config().tick_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = scheduler.tick().await {
                        error!("scheduler tick failed: {e}");
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("tick loop stopped");
                    break;
                }
            }
        }
    });
}

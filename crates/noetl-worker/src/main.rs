// NoETL worker entrypoint.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use noetl_worker::{Worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "noetl_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env();
    info!(
        server = %config.server_url,
        pool = %config.pool,
        worker_id = %config.worker_id,
        "starting noetl worker"
    );

    let worker = std::sync::Arc::new(Worker::new(config));

    let shutdown_worker = worker.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        shutdown_worker.shutdown();
    });

    worker.run().await?;
    Ok(())
}

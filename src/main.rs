use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::signal;

use poll_pulse::config::Config;
use poll_pulse::db::Database;
use poll_pulse::handlers;
use poll_pulse::pipeline::{Pipeline, Stores};
use poll_pulse::store::{DedupStore, InMemoryDedupStore, RedisDedupStore};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    if let Err(e) = run().await {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::load()?;

    let database = Arc::new(Database::connect(&config.database_url).await?);
    info!("Connected to {}", config.database_url);

    let dedup: Arc<dyn DedupStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisDedupStore::connect(url).await?),
        None => {
            info!("REDIS_URL not set, deduplicating votes in memory");
            Arc::new(InMemoryDedupStore::new())
        }
    };

    let pipeline = Pipeline::start(
        &config,
        Stores {
            dedup,
            counters: database.clone(),
            catalog: Some(database.clone()),
        },
    )?;

    let app = handlers::router(pipeline.app_state());
    let address = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&address).await?;
    info!("Voting API listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let report = pipeline.shutdown().await;
    info!(
        "Shut down cleanly, last flush committed {} options and dropped {} votes",
        report.updates.len(),
        report.dropped_votes
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

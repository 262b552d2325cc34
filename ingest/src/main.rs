//! Ratefeed service binary.
//!
//! Keeps an in-memory currency rate table up to date from the configured
//! rate stream until the process is interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratefeed_fx::{RateStore, SharedRateStore};
use ratefeed_ingest::{
    IngestConfig, IngestPipeline, KafkaConnector, StreamConnector, TcpConnector, Transport,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = IngestConfig::from_env();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting ratefeed");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let store: SharedRateStore = Arc::new(RateStore::new());
    let connector: Arc<dyn StreamConnector> = match config.transport {
        Transport::Kafka => Arc::new(KafkaConnector::new(&config)),
        Transport::Tcp => Arc::new(TcpConnector::new(&config)),
    };
    let pipeline = Arc::new(IngestPipeline::new(store.clone(), connector));
    let shutting_down = Arc::new(AtomicBool::new(false));

    // Set up graceful shutdown
    {
        let pipeline = pipeline.clone();
        let shutting_down = shutting_down.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
            info!("Shutdown signal received");
            shutting_down.store(true, Ordering::SeqCst);
            if let Err(e) = pipeline.stop().await {
                error!(error = %e, "Error during shutdown");
            }
        });
    }

    let watchdog = tokio::spawn(watch_staleness(store.clone(), config.stale_after));

    info!(
        transport = %config.transport,
        address = %config.address(),
        topic = %config.topic,
        "Ratefeed running"
    );

    let mut restarts = 0;
    let outcome = loop {
        if shutting_down.load(Ordering::SeqCst) {
            break Ok(());
        }
        pipeline.start()?;
        // A signal may have arrived before this run existed.
        if shutting_down.load(Ordering::SeqCst) {
            pipeline.stop().await?;
            break Ok(());
        }
        let result = pipeline.join().await;

        if shutting_down.load(Ordering::SeqCst) {
            break Ok(());
        }

        match result {
            Ok(()) => break Ok(()),
            Err(e) if config.restart_on_failure && restarts < config.max_restarts => {
                restarts += 1;
                warn!(
                    error = %e,
                    restarts,
                    max_restarts = config.max_restarts,
                    delay_ms = config.restart_delay.as_millis() as u64,
                    "Restarting rate ingestion"
                );
                tokio::time::sleep(config.restart_delay).await;
            }
            Err(e) => {
                error!(error = %e, restarts, "Rate ingestion failed, giving up");
                break Err(anyhow::anyhow!("Rate ingestion failed: {}", e));
            }
        }
    };

    watchdog.abort();

    let metrics = pipeline.metrics().snapshot();
    info!(
        version = store.version(),
        messages_applied = metrics.messages_applied,
        messages_dropped = metrics.messages_dropped,
        stream_failures = metrics.stream_failures,
        "Ratefeed shutdown complete"
    );

    outcome
}

/// Periodically warn when the published table stops advancing.
async fn watch_staleness(store: SharedRateStore, stale_after: std::time::Duration) {
    let mut interval = tokio::time::interval(stale_after);
    // The first tick fires immediately, before anything could be published.
    interval.tick().await;

    loop {
        interval.tick().await;
        if store.is_stale(stale_after) {
            warn!(
                version = store.version(),
                age_ms = store.age().map(|age| age.num_milliseconds()),
                "Rate table is stale"
            );
        }
    }
}

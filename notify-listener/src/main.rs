// ============================================================================
// Notify Listener - notify queue -> pending notification table
// ============================================================================
//
// Consumes batch sets published to the notify queue and merges them into an
// in-process Aggregator keyed by recipient, where delivery workers pick them
// up.
//
// Flow:
// 1. Connect to RabbitMQ (bounded retries; giving up stops the process)
// 2. Subscribe with prefetch 1 and manual acknowledgement
// 3. For each delivery: decode the batch set and merge it
//    - decoded and merged -> ack
//    - malformed payload  -> logged, requeued after a short backoff
// 4. SIGTERM/SIGINT: finish the current delivery, cancel the subscription,
//    exit
//
// ============================================================================

use anyhow::{Context, Result};
use courier_config::Config;
use courier_shared::{
    Aggregator, AmqpBroker, ChannelSettings, ConsumerLoop, NotifyHandler, ResilientChannel,
    StopHandle,
};
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let mut config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.rust_log.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Several listeners may share the queue; tags must be unique per channel
    config.consumer.consumer_tag = format!(
        "{}-{}",
        config.consumer.consumer_tag,
        uuid::Uuid::new_v4().simple()
    );

    info!("=== Notify Listener Starting ===");
    info!("RabbitMQ: {}", config.broker.redacted_uri());
    info!("Queue: {}", config.broker.queue);
    info!(
        "Connect strategy: {} ({} tries, {:?} apart)",
        config.broker.connect_strategy.as_str(),
        config.broker.max_connect_tries,
        config.broker.retry_delay
    );
    info!("Consumer tag: {}", config.consumer.consumer_tag);
    info!("Prefetch: {}", config.consumer.prefetch_count);

    let aggregator = Aggregator::new();
    let channel = ResilientChannel::new(
        AmqpBroker::new(&config.broker),
        ChannelSettings::from_config(&config.broker),
    );
    channel
        .open()
        .await
        .context("Failed to connect to RabbitMQ")?;

    let consumer = ConsumerLoop::new(
        channel,
        NotifyHandler::new(aggregator.clone()),
        &config.consumer,
    );

    spawn_shutdown_listener(consumer.stop_handle());

    let reporter = tokio::spawn(report_pending(
        aggregator.clone(),
        config.consumer.pending_report_interval,
    ));

    let result = consumer.run().await;
    reporter.abort();

    match result {
        Ok(()) => {
            let pending = aggregator.pending_recipients().await;
            info!(
                pending_recipients = pending.len(),
                "Notify listener stopped gracefully"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Notify listener stopped");
            Err(e).context("Consumer loop failed")
        }
    }
}

/// Stops the consumer on SIGTERM/Ctrl-C
fn spawn_shutdown_listener(stop: StopHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            info!("SIGTERM received, initiating graceful shutdown...");
                        }
                        _ = tokio::signal::ctrl_c() => {
                            info!("SIGINT received, initiating graceful shutdown...");
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to register SIGTERM handler, listening for Ctrl-C only");
                    tokio::signal::ctrl_c().await.ok();
                    info!("SIGINT received, initiating graceful shutdown...");
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl-C received, initiating graceful shutdown...");
        }
        stop.stop();
    });
}

/// Logs the size of the pending table periodically
async fn report_pending(aggregator: Aggregator, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let snapshot = aggregator.snapshot().await;
        info!(
            pending_recipients = snapshot.updates.len(),
            pending_messages = snapshot.message_count(),
            "Notify listener metrics (last {:?})",
            interval
        );

        match courier_metrics::gather_metrics() {
            Ok(text) => debug!(metrics = %text, "Prometheus snapshot"),
            Err(e) => error!(error = %e, "Failed to gather metrics"),
        }
    }
}

// ============================================================================
// Courier Config - Centralized configuration management
// ============================================================================
//
// Configuration for the notification publisher and listener processes.
// Everything is read from environment variables (a `.env` file is honoured)
// with defaults that match a local RabbitMQ.
//
// ============================================================================

mod broker;
mod constants;
mod consumer;

pub use broker::{BrokerConfig, ConnectStrategy};
pub use constants::DEFAULT_NOTIFY_QUEUE;
pub use consumer::ConsumerConfig;

use anyhow::Result;

/// Main configuration structure for courier services
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Tracing filter directive, e.g. "info" or "courier_shared=debug"
    pub rust_log: String,

    // Sub-configurations
    pub broker: BrokerConfig,
    pub consumer: ConsumerConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let broker = BrokerConfig::from_env()?;
        let consumer = ConsumerConfig::from_env()?;

        Ok(Self {
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            broker,
            consumer,
        })
    }
}

// ============================================================================
// Consumer Configuration
// ============================================================================

use anyhow::{Result, bail};
use std::time::Duration;

use crate::constants::*;

/// Settings for the queue consumer loop of the listener service
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// Consumer tag announced to the broker
    pub consumer_tag: String,
    /// Unacknowledged deliveries allowed in flight (1 = strict one-at-a-time)
    pub prefetch_count: u16,
    /// Pause before a failed delivery is handed back to the broker
    pub reject_backoff: Duration,
    /// How often the listener logs pending-table statistics
    pub pending_report_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_tag: DEFAULT_CONSUMER_TAG.to_string(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            reject_backoff: Duration::from_millis(DEFAULT_REJECT_BACKOFF_MS),
            pending_report_interval: Duration::from_secs(DEFAULT_PENDING_REPORT_INTERVAL_SECS),
        }
    }
}

impl ConsumerConfig {
    pub(crate) fn from_env() -> Result<Self> {
        let config = Self {
            consumer_tag: std::env::var("CONSUMER_TAG")
                .unwrap_or_else(|_| DEFAULT_CONSUMER_TAG.to_string()),
            prefetch_count: std::env::var("CONSUMER_PREFETCH")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PREFETCH_COUNT),
            reject_backoff: Duration::from_millis(
                std::env::var("CONSUMER_REJECT_BACKOFF_MS")
                    .ok()
                    .and_then(|b| b.parse().ok())
                    .unwrap_or(DEFAULT_REJECT_BACKOFF_MS),
            ),
            pending_report_interval: Duration::from_secs(
                std::env::var("PENDING_REPORT_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_PENDING_REPORT_INTERVAL_SECS),
            ),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefetch_count == 0 {
            // 0 means "unlimited" to an AMQP broker, which disables backpressure
            bail!("CONSUMER_PREFETCH must be at least 1");
        }
        if self.consumer_tag.is_empty() {
            bail!("CONSUMER_TAG must not be empty");
        }
        if self.pending_report_interval.is_zero() {
            bail!("PENDING_REPORT_INTERVAL_SECS must be at least 1");
        }
        Ok(())
    }
}

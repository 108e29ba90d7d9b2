// ============================================================================
// Configuration Constants
// ============================================================================

// Broker endpoint
pub(crate) const DEFAULT_BROKER_HOST: &str = "localhost";
pub(crate) const DEFAULT_BROKER_PORT: u16 = 5672;
pub(crate) const DEFAULT_BROKER_USER: &str = "guest";
pub(crate) const DEFAULT_BROKER_PASSWORD: &str = "guest";
pub(crate) const DEFAULT_BROKER_VHOST: &str = "/";

/// Durable queue carrying serialized batch sets between bots and backends
pub const DEFAULT_NOTIFY_QUEUE: &str = "notify";

// Connect retry policy: 5 attempts, 2 seconds apart
pub(crate) const DEFAULT_MAX_CONNECT_TRIES: u32 = 5;
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 2000;

// Consumer
pub(crate) const DEFAULT_CONSUMER_TAG: &str = "listener";
pub(crate) const DEFAULT_PREFETCH_COUNT: u16 = 1;
pub(crate) const DEFAULT_REJECT_BACKOFF_MS: u64 = 100;
pub(crate) const DEFAULT_PENDING_REPORT_INTERVAL_SECS: u64 = 30;

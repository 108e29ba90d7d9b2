// ============================================================================
// Resilient Channel
// ============================================================================
//
// One logical broker connection + channel shared by a publisher or a
// consumer. The channel handle sits behind an async mutex, so at most one
// broker operation is in flight per channel and publishes go out in call
// order.
//
// State machine (observable through `subscribe_state`):
//
//   Disconnected -> Connecting -> Connected
//        ^              |            |
//        +--------------+------------+   (retries exhausted / I/O failure)
//
// Connecting makes up to `max_connect_tries` attempts, `retry_delay` apart.
// Each attempt opens a connection and a channel and declares the durable
// queue. Running out of attempts is fatal for the caller.
//
// Strategies:
// - Eager: `open()` connects up front, and after an I/O failure the channel
//   reconnects right away
// - Lazy: the first publish/consume connects, and after an I/O failure the
//   reconnect waits for the retry step of the failed operation
//
// ============================================================================

use courier_config::{BrokerConfig, ConnectStrategy};
use courier_metrics::{BROKER_CONNECT_ATTEMPTS, BROKER_CONNECT_EXHAUSTED, BROKER_RECONNECTS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerChannel, BrokerError, DeliveryStream};
use crate::error::ChannelError;

/// Connection parameters the channel needs at runtime
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub host: String,
    pub port: u16,
    pub queue: String,
    pub max_connect_tries: u32,
    pub retry_delay: Duration,
    pub strategy: ConnectStrategy,
}

impl ChannelSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            queue: config.queue.clone(),
            max_connect_tries: config.max_connect_tries,
            retry_delay: config.retry_delay,
            strategy: config.connect_strategy,
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct ResilientChannel<B: Broker> {
    inner: Arc<Inner<B>>,
}

impl<B: Broker> Clone for ResilientChannel<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<B: Broker> {
    broker: B,
    settings: ChannelSettings,
    slot: Arc<Mutex<Option<B::Channel>>>,
    state: watch::Sender<ChannelState>,
}

impl<B: Broker> ResilientChannel<B> {
    /// Creates a disconnected channel. Nothing is opened until `open`,
    /// `connect` or the first operation.
    pub fn new(broker: B, settings: ChannelSettings) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                broker,
                settings,
                slot: Arc::new(Mutex::new(None)),
                state,
            }),
        }
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.inner.settings
    }

    pub fn queue(&self) -> &str {
        &self.inner.settings.queue
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Connects if no usable channel exists
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let mut slot = self.inner.slot.lock().await;
        self.inner.ensure_connected(&mut slot).await.map(|_| ())
    }

    /// True when a channel exists and reports open
    pub async fn has_connection(&self) -> bool {
        self.inner
            .slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    /// Applies the connect strategy: Eager connects now, Lazy defers to the
    /// first operation.
    pub async fn open(&self) -> Result<(), ChannelError> {
        match self.inner.settings.strategy {
            ConnectStrategy::Eager => self.connect().await,
            ConnectStrategy::Lazy => Ok(()),
        }
    }

    /// Like `open`, but returns at once. The connect runs on a spawned task
    /// that holds the channel lock, so operations issued meanwhile wait for
    /// it. The handle yields the connect result.
    pub fn open_in_background(&self) -> JoinHandle<Result<(), ChannelError>> {
        if self.inner.settings.strategy == ConnectStrategy::Lazy {
            return tokio::spawn(async { Ok(()) });
        }

        let inner = self.inner.clone();
        match inner.slot.clone().try_lock_owned() {
            Ok(mut slot) => tokio::spawn(async move {
                inner.ensure_connected(&mut slot).await.map(|_| ())
            }),
            Err(_) => tokio::spawn(async move {
                let mut slot = inner.slot.clone().lock_owned().await;
                inner.ensure_connected(&mut slot).await.map(|_| ())
            }),
        }
    }

    /// Publishes `payload` to the queue and waits for the broker confirm.
    ///
    /// A failed publish drops the channel, reconnects and retries once. A
    /// second failure is returned as [`ChannelError::Publish`]; failing to
    /// reconnect is [`ChannelError::ConnectionExhausted`].
    pub async fn publish(&self, payload: &[u8]) -> Result<(), ChannelError> {
        let inner = &self.inner;
        let queue = inner.settings.queue.as_str();
        let mut slot = inner.slot.lock().await;

        let first = inner
            .ensure_connected(&mut slot)
            .await?
            .publish(queue, payload)
            .await;
        let Err(e) = first else {
            return Ok(());
        };

        warn!(queue = %queue, error = %e, "Publish failed, reconnecting and retrying once");
        inner.discard(&mut slot).await?;
        BROKER_RECONNECTS.inc();

        let retry = inner
            .ensure_connected(&mut slot)
            .await?
            .publish(queue, payload)
            .await;
        if let Err(source) = retry {
            error!(queue = %queue, error = %source, "Publish failed after reconnect");
            inner.drop_channel(&mut slot);
            return Err(ChannelError::Publish {
                queue: queue.to_string(),
                source,
            });
        }
        Ok(())
    }

    /// Sets QoS to `prefetch_count` and subscribes to the queue with manual
    /// acknowledgement. Retried once on a fresh channel like `publish`.
    pub async fn consume(
        &self,
        consumer_tag: &str,
        prefetch_count: u16,
    ) -> Result<DeliveryStream, ChannelError> {
        let inner = &self.inner;
        let queue = inner.settings.queue.as_str();
        let mut slot = inner.slot.lock().await;

        let first = inner
            .ensure_connected(&mut slot)
            .await?
            .consume(queue, consumer_tag, prefetch_count)
            .await;
        let e = match first {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };

        warn!(queue = %queue, error = %e, "Subscribe failed, reconnecting and retrying once");
        inner.discard(&mut slot).await?;
        BROKER_RECONNECTS.inc();

        let retry = inner
            .ensure_connected(&mut slot)
            .await?
            .consume(queue, consumer_tag, prefetch_count)
            .await;
        retry.map_err(|source| {
            error!(queue = %queue, error = %source, "Subscribe failed after reconnect");
            inner.drop_channel(&mut slot);
            ChannelError::Consume {
                queue: queue.to_string(),
                source,
            }
        })
    }

    /// Stops the subscription. A channel that is already gone has nothing to
    /// cancel.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), ChannelError> {
        let slot = self.inner.slot.lock().await;
        match slot.as_ref() {
            Some(channel) if channel.is_open() => {
                channel
                    .cancel(consumer_tag)
                    .await
                    .map_err(|source| ChannelError::Consume {
                        queue: self.inner.settings.queue.clone(),
                        source,
                    })
            }
            _ => Ok(()),
        }
    }

    /// Reports an I/O failure observed outside the channel (for example a
    /// broken delivery stream). The channel is dropped and, under Eager,
    /// reconnected before returning.
    pub async fn recover(&self) -> Result<(), ChannelError> {
        let mut slot = self.inner.slot.lock().await;
        self.inner.discard(&mut slot).await?;
        BROKER_RECONNECTS.inc();
        Ok(())
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        let mut slot = self.inner.slot.lock().await;
        let channel = slot.take();
        self.inner.state.send_replace(ChannelState::Disconnected);

        match channel {
            Some(channel) if channel.is_open() => channel.close().await,
            _ => Ok(()),
        }
    }
}

impl<B: Broker> Inner<B> {
    /// Returns the live channel, connecting first if there is none
    async fn ensure_connected<'a>(
        &self,
        slot: &'a mut Option<B::Channel>,
    ) -> Result<&'a B::Channel, ChannelError> {
        let channel = match slot.take() {
            Some(channel) if channel.is_open() => channel,
            stale => {
                if stale.is_some() {
                    debug!(queue = %self.settings.queue, "Discarding closed broker channel");
                    self.state.send_replace(ChannelState::Disconnected);
                }
                self.establish().await?
            }
        };
        Ok(&*slot.insert(channel))
    }

    /// Drops the current channel after an I/O failure. Eager reconnects
    /// immediately, Lazy leaves the slot empty for the next operation.
    async fn discard(&self, slot: &mut Option<B::Channel>) -> Result<(), ChannelError> {
        self.drop_channel(slot);
        match self.settings.strategy {
            ConnectStrategy::Eager => self.ensure_connected(slot).await.map(|_| ()),
            ConnectStrategy::Lazy => Ok(()),
        }
    }

    fn drop_channel(&self, slot: &mut Option<B::Channel>) {
        slot.take();
        self.state.send_replace(ChannelState::Disconnected);
    }

    async fn establish(&self) -> Result<B::Channel, ChannelError> {
        let settings = &self.settings;
        let max_tries = settings.max_connect_tries.max(1);
        self.state.send_replace(ChannelState::Connecting);

        let mut abandoned = AbandonedConnect {
            state: &self.state,
            armed: true,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.open_once().await {
                Ok(channel) => {
                    abandoned.armed = false;
                    BROKER_CONNECT_ATTEMPTS.with_label_values(&["success"]).inc();
                    self.state.send_replace(ChannelState::Connected);
                    info!(
                        host = %settings.host,
                        port = settings.port,
                        queue = %settings.queue,
                        attempt,
                        "Connected to broker"
                    );
                    return Ok(channel);
                }
                Err(e) if attempt >= max_tries => {
                    abandoned.armed = false;
                    BROKER_CONNECT_ATTEMPTS.with_label_values(&["failure"]).inc();
                    BROKER_CONNECT_EXHAUSTED.inc();
                    self.state.send_replace(ChannelState::Disconnected);
                    error!(
                        host = %settings.host,
                        port = settings.port,
                        attempts = attempt,
                        error = %e,
                        "Giving up on broker connection"
                    );
                    return Err(ChannelError::ConnectionExhausted {
                        host: settings.host.clone(),
                        port: settings.port,
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    BROKER_CONNECT_ATTEMPTS.with_label_values(&["failure"]).inc();
                    warn!(
                        host = %settings.host,
                        port = settings.port,
                        attempt,
                        max_tries,
                        error = %e,
                        "Broker connection failed, retrying in {:?}",
                        settings.retry_delay
                    );
                    tokio::time::sleep(settings.retry_delay).await;
                }
            }
        }
    }

    async fn open_once(&self) -> Result<B::Channel, BrokerError> {
        let channel = self.broker.connect().await?;
        channel.declare_queue(&self.settings.queue).await?;
        Ok(channel)
    }
}

/// Puts the state back to Disconnected when a connect in progress is dropped
struct AbandonedConnect<'a> {
    state: &'a watch::Sender<ChannelState>,
    armed: bool,
}

impl Drop for AbandonedConnect<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.send_replace(ChannelState::Disconnected);
        }
    }
}

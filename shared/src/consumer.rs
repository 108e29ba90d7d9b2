// ============================================================================
// Consumer Loop
// ============================================================================
//
// Drives one subscription on the notify queue:
// 1. Subscribe with manual acknowledgement and `prefetch_count` (default 1)
// 2. For each delivery run the handler on the raw body
// 3. Handler succeeded -> ack
//    Handler failed    -> log, back off briefly, reject with requeue
//    (a failed delivery is never acknowledged, the broker hands it out again)
// 4. Stream broke or ended -> recover the channel and resubscribe
//    Reconnect retries exhausted -> the loop ends with an error
//
// Deliveries are processed one at a time, and the next one is not pulled
// from the stream before the current one is settled. With prefetch 1 the
// broker therefore never hands out message N+1 before N is acknowledged.
//
// The loop runs cooperatively on the caller's runtime (`run`) or on a
// dedicated OS thread with its own current-thread runtime
// (`spawn_dedicated`). Both share the code below.
//
// ============================================================================

use async_trait::async_trait;
use courier_config::ConsumerConfig;
use courier_metrics::{DELIVERIES_ACKED, DELIVERIES_REJECTED};
use futures_util::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::channel::ResilientChannel;
use crate::error::{ConsumerError, HandlerError};

/// Processes the body of one delivery. Returning an error leaves the message
/// on the queue for redelivery.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: DeliveryHandler + ?Sized> DeliveryHandler for Arc<H> {
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        (**self).handle(body).await
    }
}

/// Requests a graceful stop of a consumer loop. The loop finishes the
/// delivery it is handling, cancels its subscription and returns.
#[derive(Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopSignal>,
}

#[derive(Default)]
struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    async fn stopped(&self) {
        while !self.is_stopped() {
            self.inner.notify.notified().await;
        }
    }
}

pub struct ConsumerLoop<B: Broker, H: DeliveryHandler> {
    channel: ResilientChannel<B>,
    handler: H,
    consumer_tag: String,
    prefetch_count: u16,
    reject_backoff: Duration,
    stop: StopHandle,
}

impl<B: Broker, H: DeliveryHandler> ConsumerLoop<B, H> {
    pub fn new(channel: ResilientChannel<B>, handler: H, config: &ConsumerConfig) -> Self {
        Self {
            channel,
            handler,
            consumer_tag: config.consumer_tag.clone(),
            prefetch_count: config.prefetch_count.max(1),
            reject_backoff: config.reject_backoff,
            stop: StopHandle::new(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Consume until stopped.
    ///
    /// # Returns
    /// * `Ok(())` - stopped through the [`StopHandle`], also while a
    ///   reconnect is still retrying
    /// * `Err(ConsumerError::Channel)` - the broker stayed unreachable after
    ///   every reconnect attempt, or resubscribing failed
    pub async fn run(self) -> Result<(), ConsumerError> {
        info!(
            queue = %self.channel.queue(),
            consumer_tag = %self.consumer_tag,
            prefetch = self.prefetch_count,
            "Consumer loop starting"
        );

        'subscription: while !self.stop.is_stopped() {
            // connecting may retry for a while, stop must not wait for it
            let mut deliveries = tokio::select! {
                biased;
                _ = self.stop.stopped() => break 'subscription,
                subscribed = self.channel.consume(&self.consumer_tag, self.prefetch_count) => {
                    subscribed?
                }
            };
            debug!(queue = %self.channel.queue(), "Subscribed");

            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.stop.stopped() => break 'subscription,
                    next = deliveries.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => self.process(delivery).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "Delivery stream failed, resubscribing");
                        break;
                    }
                    None => {
                        warn!("Delivery stream closed by broker, resubscribing");
                        break;
                    }
                }
            }

            drop(deliveries);
            tokio::select! {
                biased;
                _ = self.stop.stopped() => break 'subscription,
                recovered = self.channel.recover() => recovered?,
            }
        }

        if let Err(e) = self.channel.cancel(&self.consumer_tag).await {
            warn!(error = %e, "Failed to cancel subscription");
        }
        info!(consumer_tag = %self.consumer_tag, "Consumer loop stopped");
        Ok(())
    }

    async fn process(&self, delivery: Delivery) {
        let redelivered = delivery.redelivered;
        let (body, acker) = delivery.into_parts();

        match self.handler.handle(&body).await {
            Ok(()) => match acker.ack().await {
                Ok(()) => {
                    DELIVERIES_ACKED.inc();
                    debug!(bytes = body.len(), redelivered, "Delivery acknowledged");
                }
                Err(e) => {
                    // the broker requeues unacknowledged messages when the channel goes away
                    warn!(error = %e, "Failed to acknowledge delivery");
                }
            },
            Err(e) => {
                DELIVERIES_REJECTED.inc();
                error!(
                    error = %e,
                    bytes = body.len(),
                    redelivered,
                    "Handler failed, requeueing delivery after {:?}",
                    self.reject_backoff
                );
                tokio::time::sleep(self.reject_backoff).await;
                if let Err(e) = acker.reject(true).await {
                    warn!(error = %e, "Failed to reject delivery");
                }
            }
        }
    }

    /// Runs the loop on a new OS thread named `name` with its own
    /// current-thread runtime.
    pub fn spawn_dedicated(self, name: impl Into<String>) -> Result<ConsumerThread, ConsumerError> {
        let stop = self.stop.clone();
        let handle = thread::Builder::new().name(name.into()).spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(self.run())
        })?;

        Ok(ConsumerThread { handle, stop })
    }
}

/// A consumer loop running on its own thread
pub struct ConsumerThread {
    handle: thread::JoinHandle<Result<(), ConsumerError>>,
    stop: StopHandle,
}

impl ConsumerThread {
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Blocks until the loop returns
    pub fn join(self) -> Result<(), ConsumerError> {
        self.handle.join().map_err(|_| ConsumerError::Panicked)?
    }
}

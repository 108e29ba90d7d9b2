// ============================================================================
// In-process broker
// ============================================================================
//
// Queues live in process memory and mirror the broker behaviour the pipeline
// relies on:
// - at most `prefetch_count` unacknowledged deliveries per subscription
// - rejected-with-requeue and never-settled deliveries go back to the head of
//   the queue flagged as redelivered
// - a broken connection closes every channel opened before it
//
// Fault injection (`fail_next_connects`, `fail_next_publishes`,
// `break_connections`) and counters (`connect_attempts`, `unacked`,
// `peak_unacked`) exist for exercising the retry paths.
//
// ============================================================================

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use super::{Acknowledger, Broker, BrokerChannel, BrokerError, Delivery, DeliveryStream};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decrements `counter` if it is positive; returns whether it was
fn consume_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    connect_attempts: AtomicU32,
    failing_connects: AtomicU32,
    failing_publishes: AtomicU32,
    generation: AtomicU64,
}

impl Shared {
    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        lock(&self.queues).get(name).cloned()
    }

    fn declare(&self, name: &str) -> Arc<MemoryQueue> {
        lock(&self.queues)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct MemoryQueue {
    ready: Mutex<VecDeque<Pending>>,
    notify: Notify,
    unacked: AtomicUsize,
    peak_unacked: AtomicUsize,
    acked: AtomicUsize,
}

struct Pending {
    body: Vec<u8>,
    redelivered: bool,
}

impl MemoryQueue {
    fn push_back(&self, body: Vec<u8>) {
        lock(&self.ready).push_back(Pending {
            body,
            redelivered: false,
        });
        self.notify.notify_one();
    }

    fn requeue(&self, body: Vec<u8>) {
        lock(&self.ready).push_front(Pending {
            body,
            redelivered: true,
        });
        self.notify.notify_one();
    }

    fn take(&self) -> Option<Pending> {
        let pending = lock(&self.ready).pop_front()?;
        let in_flight = self.unacked.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_unacked.fetch_max(in_flight, Ordering::SeqCst);
        Some(pending)
    }

    fn settle(&self) {
        self.unacked.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `connect` calls made so far, successful or not
    pub fn connect_attempts(&self) -> u32 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// The next `count` connect attempts are refused
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.failing_connects.store(count, Ordering::SeqCst);
    }

    /// The next `count` publishes on any channel are not confirmed
    pub fn fail_next_publishes(&self, count: u32) {
        self.shared.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Drops every live connection. Open channels report closed, their
    /// subscriptions end with an error and unsettled deliveries are requeued.
    pub fn break_connections(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        for queue in lock(&self.shared.queues).values() {
            queue.notify.notify_waiters();
        }
    }

    /// Declares `queue` if needed and enqueues `body` without a channel
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.shared.declare(queue).push_back(body.into());
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.shared.queue(queue).is_some()
    }

    /// Messages waiting in `queue`, not counting unacknowledged ones
    pub fn ready(&self, queue: &str) -> usize {
        self.shared
            .queue(queue)
            .map_or(0, |q| lock(&q.ready).len())
    }

    /// Copies of the waiting message bodies, head first
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared.queue(queue).map_or_else(Vec::new, |q| {
            lock(&q.ready).iter().map(|p| p.body.clone()).collect()
        })
    }

    pub fn unacked(&self, queue: &str) -> usize {
        self.shared
            .queue(queue)
            .map_or(0, |q| q.unacked.load(Ordering::SeqCst))
    }

    /// Highest number of simultaneously unacknowledged deliveries seen
    pub fn peak_unacked(&self, queue: &str) -> usize {
        self.shared
            .queue(queue)
            .map_or(0, |q| q.peak_unacked.load(Ordering::SeqCst))
    }

    pub fn acked(&self, queue: &str) -> usize {
        self.shared
            .queue(queue)
            .map_or(0, |q| q.acked.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Channel = MemoryChannel;

    async fn connect(&self) -> Result<MemoryChannel, BrokerError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if consume_one(&self.shared.failing_connects) {
            return Err(BrokerError::ConnectionRefused(
                "memory broker refused the connection".to_string(),
            ));
        }

        Ok(MemoryChannel {
            shared: self.shared.clone(),
            generation: self.shared.generation(),
            closed: AtomicBool::new(false),
        })
    }
}

pub struct MemoryChannel {
    shared: Arc<Shared>,
    generation: u64,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    fn declared(&self, queue: &str) -> Result<Arc<MemoryQueue>, BrokerError> {
        self.shared
            .queue(queue)
            .ok_or_else(|| BrokerError::QueueNotDeclared(queue.to_string()))
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.generation == self.shared.generation()
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared.declare(queue);
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if consume_one(&self.shared.failing_publishes) {
            return Err(BrokerError::Nacked(queue.to_string()));
        }
        self.declared(queue)?.push_back(payload.to_vec());
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        prefetch_count: u16,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let subscription = Subscription {
            shared: self.shared.clone(),
            generation: self.generation,
            queue: self.declared(queue)?,
            permits: Arc::new(Semaphore::new(usize::from(prefetch_count.max(1)))),
            finished: false,
        };

        Ok(Box::pin(futures_util::stream::unfold(
            subscription,
            |mut subscription| async move {
                let item = subscription.next_delivery().await?;
                Some((item, subscription))
            },
        )))
    }

    async fn cancel(&self, _consumer_tag: &str) -> Result<(), BrokerError> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Subscription {
    shared: Arc<Shared>,
    generation: u64,
    queue: Arc<MemoryQueue>,
    permits: Arc<Semaphore>,
    finished: bool,
}

impl Subscription {
    fn is_live(&self) -> bool {
        self.generation == self.shared.generation()
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        if self.finished {
            return None;
        }

        // Prefetch window: a permit is held until the delivery is settled
        let permit = self.permits.clone().acquire_owned().await.ok()?;

        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_live() {
                self.finished = true;
                return Some(Err(BrokerError::ChannelClosed));
            }

            if let Some(pending) = self.queue.take() {
                let acker = MemoryAcker {
                    shared: self.shared.clone(),
                    generation: self.generation,
                    queue: self.queue.clone(),
                    body: Some(pending.body.clone()),
                    _permit: permit,
                };
                return Some(Ok(Delivery::new(pending.body, pending.redelivered, acker)));
            }

            notified.await;
        }
    }
}

/// Unsettled deliveries are requeued when the acker is dropped, as a broker
/// does when the consuming channel goes away.
struct MemoryAcker {
    shared: Arc<Shared>,
    generation: u64,
    queue: Arc<MemoryQueue>,
    body: Option<Vec<u8>>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryAcker {
    fn settle(&mut self, requeue: bool) -> Result<(), BrokerError> {
        let Some(body) = self.body.take() else {
            return Ok(());
        };
        self.queue.settle();

        if self.generation != self.shared.generation() {
            self.queue.requeue(body);
            return Err(BrokerError::ChannelClosed);
        }

        if requeue {
            self.queue.requeue(body);
        } else {
            self.queue.acked.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(body) = self.body.take() {
            self.queue.settle();
            self.queue.requeue(body);
        }
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        let mut acker = self;
        acker.settle(false)
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        let mut acker = self;
        if requeue {
            return acker.settle(true);
        }
        // dead-lettering is not modelled, the message is dropped
        if acker.body.take().is_some() {
            acker.queue.settle();
        }
        Ok(())
    }
}

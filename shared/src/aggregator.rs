// ============================================================================
// Aggregator
// ============================================================================
//
// Process-local table of pending notifications, keyed by recipient. Incoming
// batch sets are merged into it; delivery workers pop a recipient's batch
// once they are ready to notify that user.
//
// Every operation takes the table lock exactly once, so `pop_for` never
// observes half of a concurrent `add_information`.
//
// ============================================================================

use async_trait::async_trait;
use courier_metrics::PENDING_RECIPIENTS;
use courier_types::{BatchSet, NotFoundError, RecipientBatch, UserId};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::consumer::DeliveryHandler;
use crate::error::HandlerError;

#[derive(Clone, Default)]
pub struct Aggregator {
    pending: Arc<Mutex<BatchSet>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `batch_set` into the pending table
    pub async fn add_information(&self, batch_set: BatchSet) {
        let mut pending = self.pending.lock().await;
        pending.merge(batch_set);
        report(&pending);
    }

    /// Takes everything pending for `user_id`
    pub async fn pop_for(&self, user_id: UserId) -> Result<RecipientBatch, NotFoundError> {
        let mut pending = self.pending.lock().await;
        let batch = pending.pop_for(user_id);
        report(&pending);
        batch
    }

    pub async fn try_pop_for(&self, user_id: UserId) -> Option<RecipientBatch> {
        self.pop_for(user_id).await.ok()
    }

    pub async fn contains(&self, user_id: UserId) -> bool {
        self.pending.lock().await.contains(user_id)
    }

    /// Forgets a recipient's pending work; returns whether there was any
    pub async fn remove(&self, user_id: UserId) -> bool {
        let mut pending = self.pending.lock().await;
        let removed = pending.remove(user_id);
        report(&pending);
        removed
    }

    pub async fn pending_recipients(&self) -> Vec<UserId> {
        self.pending.lock().await.recipients()
    }

    /// Takes the whole pending table, leaving it empty
    pub async fn drain(&self) -> BatchSet {
        let mut pending = self.pending.lock().await;
        let drained = std::mem::take(&mut *pending);
        report(&pending);
        drained
    }

    pub async fn snapshot(&self) -> BatchSet {
        self.pending.lock().await.clone()
    }
}

fn report(pending: &BatchSet) {
    PENDING_RECIPIENTS.set(pending.updates.len() as i64);
}

/// Feeds notify-queue deliveries into an [`Aggregator`]
#[derive(Clone)]
pub struct NotifyHandler {
    aggregator: Aggregator,
}

impl NotifyHandler {
    pub fn new(aggregator: Aggregator) -> Self {
        Self { aggregator }
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }
}

#[async_trait]
impl DeliveryHandler for NotifyHandler {
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        let batch_set = BatchSet::from_json_slice(body)?;
        debug!(
            recipients = batch_set.updates.len(),
            messages = batch_set.message_count(),
            "Received batch set"
        );
        self.aggregator.add_information(batch_set).await;
        Ok(())
    }
}

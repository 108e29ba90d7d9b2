// ============================================================================
// Test Utilities for the notification pipeline
// ============================================================================
//
// Builders for messages and batch sets, channel settings with short retry
// delays, and scripted delivery handlers for driving the consumer loop
// against the in-process broker.
//
// ============================================================================

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use courier_config::{ConnectStrategy, ConsumerConfig};
use courier_shared::{ChannelSettings, DeliveryHandler, HandlerError};
use courier_types::{BatchSet, BotUpdate, Message, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

pub const QUEUE: &str = "notify";

pub fn settings(strategy: ConnectStrategy, max_connect_tries: u32) -> ChannelSettings {
    ChannelSettings {
        queue: QUEUE.to_string(),
        max_connect_tries,
        retry_delay: Duration::from_millis(5),
        strategy,
        ..ChannelSettings::default()
    }
}

pub fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        consumer_tag: "test-listener".to_string(),
        prefetch_count: 1,
        reject_backoff: Duration::from_millis(5),
        ..ConsumerConfig::default()
    }
}

pub fn message(id: i64) -> Message {
    let time = Utc.with_ymd_and_hms(2021, 1, 1, 1, 1, 31).unwrap();
    Message::new(id, "text", time, Sender::new(1, "user"))
}

/// One message in `chat_id` of `bot_id`, addressed to every recipient
pub fn batch(bot_id: i64, chat_id: i64, message_id: i64, recipients: &[i64]) -> BatchSet {
    BatchSet::for_recipients(
        BotUpdate::single(bot_id, chat_id, message(message_id)),
        recipients.iter().copied(),
    )
}

pub fn body(batch_set: &BatchSet) -> Vec<u8> {
    batch_set.to_json_vec().unwrap()
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// passes; returns the last outcome.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Records every body it sees
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl DeliveryHandler for RecordingHandler {
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        self.seen.lock().await.push(body.to_vec());
        Ok(())
    }
}

/// Fails the first `failures` calls, then succeeds
pub struct FlakyHandler {
    failures: usize,
    pub calls: AtomicUsize,
}

impl FlakyHandler {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryHandler for FlakyHandler {
    async fn handle(&self, _body: &[u8]) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(HandlerError::Other(anyhow::anyhow!("transient failure #{call}")));
        }
        Ok(())
    }
}

/// Suspends inside every call until the test releases a permit, so the
/// test decides when each delivery finishes.
pub struct GatedHandler {
    pub gate: Arc<Semaphore>,
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
}

impl GatedHandler {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }
}

#[async_trait]
impl DeliveryHandler for GatedHandler {
    async fn handle(&self, _body: &[u8]) -> Result<(), HandlerError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| HandlerError::Other(e.into()))?;
        permit.forget();
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// Broker module: transport seam between the resilient channel and a concrete
// message broker.
//
// Two implementations:
// - `amqp`: RabbitMQ (AMQP 0-9-1) through lapin, used by the services
// - `memory`: in-process queues with the same ack/prefetch semantics, used for
//   local runs and tests

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::fmt;
use thiserror::Error;

pub use amqp::{AmqpBroker, AmqpChannel};
pub use memory::{MemoryBroker, MemoryChannel};

/// Deliveries pushed by the broker for one subscription
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Transport-level failures reported by a broker implementation
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Queue '{0}' is not declared")]
    QueueNotDeclared(String),

    #[error("Broker did not confirm publish to '{0}'")]
    Nacked(String),
}

/// Opens connections to a broker
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Opens one connection and one channel on it
    async fn connect(&self) -> Result<Self::Channel, BrokerError>;
}

/// One open channel on a broker connection
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// True while both the channel and its connection are usable
    fn is_open(&self) -> bool;

    /// Declares `queue` as durable. Repeating the declaration is a no-op.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Publishes a persistent message and waits for the broker to confirm it
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Subscribes to `queue` with manual acknowledgement and at most
    /// `prefetch_count` unacknowledged deliveries in flight
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch_count: u16,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Stops the subscription registered under `consumer_tag`
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Settles one delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + 'static {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Negative acknowledgement; with `requeue` the broker redelivers it
    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// A message received from a queue, to be settled exactly once
pub struct Delivery {
    pub body: Vec<u8>,
    /// Set when the broker has handed this message out before
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, redelivered: bool, acker: impl Acknowledger) -> Self {
        Self {
            body,
            redelivered,
            acker: Box::new(acker),
        }
    }

    /// Splits the payload from its acknowledger so the body can be handed to a
    /// handler while the acknowledger waits for the outcome
    pub fn into_parts(self) -> (Vec<u8>, Box<dyn Acknowledger>) {
        (self.body, self.acker)
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

use courier_metrics::{NOTIFY_PUBLISH_FAILURE, NOTIFY_PUBLISH_SUCCESS};
use courier_types::BatchSet;
use tracing::{debug, error};

use crate::broker::Broker;
use crate::channel::{ChannelSettings, ResilientChannel};
use crate::error::{ChannelError, PublishError};

/// Raw message body. Text is sent as its UTF-8 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Publishes update batches to the notify queue
///
/// Messages are persistent and published with broker confirms, so every
/// publish suspends until the broker has taken responsibility for it. Calls on
/// one publisher go out in call order.
pub struct NotifyPublisher<B: Broker> {
    channel: ResilientChannel<B>,
}

impl<B: Broker> NotifyPublisher<B> {
    pub fn new(channel: ResilientChannel<B>) -> Self {
        Self { channel }
    }

    /// Builds the channel and applies its connect strategy
    ///
    /// # Returns
    /// * `Ok(publisher)` - Eager: connected; Lazy: connects on first publish
    /// * `Err(ChannelError::ConnectionExhausted)` - Eager connect gave up
    pub async fn open(broker: B, settings: ChannelSettings) -> Result<Self, ChannelError> {
        let channel = ResilientChannel::new(broker, settings);
        channel.open().await?;
        Ok(Self::new(channel))
    }

    pub fn channel(&self) -> &ResilientChannel<B> {
        &self.channel
    }

    /// Publish a raw payload
    ///
    /// # Arguments
    /// * `payload` - `&str`, `String`, `&[u8]` or `Vec<u8>`
    pub async fn publish(&self, payload: impl Into<Payload>) -> Result<(), ChannelError> {
        let payload = payload.into();
        match self.channel.publish(payload.as_bytes()).await {
            Ok(()) => {
                NOTIFY_PUBLISH_SUCCESS.inc();
                debug!(queue = %self.channel.queue(), bytes = payload.len(), "Published notification");
                Ok(())
            }
            Err(e) => {
                NOTIFY_PUBLISH_FAILURE.inc();
                error!(queue = %self.channel.queue(), error = %e, "Failed to publish notification");
                Err(e)
            }
        }
    }

    /// Serialize and publish a batch set
    ///
    /// # Returns
    /// * `Ok(true)` - published
    /// * `Ok(false)` - the batch set had no recipients, nothing was sent
    pub async fn publish_batch(&self, batch_set: &BatchSet) -> Result<bool, PublishError> {
        if batch_set.is_empty() {
            debug!("Skipping publish of empty batch set");
            return Ok(false);
        }

        let payload = batch_set.to_json_vec()?;
        self.publish(payload).await?;
        debug!(
            recipients = batch_set.recipients().len(),
            messages = batch_set.message_count(),
            "Published batch set"
        );
        Ok(true)
    }

    pub async fn close(&self) {
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "Error while closing publisher channel");
        }
    }
}

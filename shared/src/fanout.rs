// ============================================================================
// Fan-out - persisted message -> batch set
// ============================================================================
//
// When a message is stored, every user subscribed to its chat must be told.
// The message is wrapped as BotUpdate(bot) -> Chat(chat) -> Message and one
// RecipientBatch per subscriber is produced:
//
// - Messenger { bot_id }: a messenger user wrote through a bot; the bot is
//   known from the source and every subscriber of the chat is notified
// - Web { operator_id }: an operator answered from the backend; the bot is
//   looked up from the chat. Every subscriber is notified, the operator
//   included, so their other sessions see the answer too
//
// ============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use courier_types::{BatchSet, BotId, BotUpdate, ChatId, Message, MessageSource, UserId};
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::publisher::NotifyPublisher;

/// Read-only lookups into the persistence layer
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    /// Users subscribed to `chat_id`, in subscription order
    async fn recipients_for_chat(&self, chat_id: ChatId) -> Result<Vec<UserId>>;

    /// Bot that owns `chat_id`, `None` for an unknown chat
    async fn bot_for_chat(&self, chat_id: ChatId) -> Result<Option<BotId>>;
}

/// A message right after it was stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedMessage {
    pub chat_id: ChatId,
    pub source: MessageSource,
    pub message: Message,
}

impl PersistedMessage {
    pub fn new(chat_id: ChatId, source: MessageSource, message: Message) -> Self {
        Self {
            chat_id,
            source,
            message,
        }
    }
}

/// Builds the batch set announcing `persisted` to the chat's subscribers.
/// An empty batch set means nobody needs to be notified.
pub async fn build_batch_set<D>(directory: &D, persisted: PersistedMessage) -> Result<BatchSet>
where
    D: RecipientDirectory + ?Sized,
{
    let chat_id = persisted.chat_id;
    let recipients = directory
        .recipients_for_chat(chat_id)
        .await
        .with_context(|| format!("Failed to load subscribers of chat {chat_id}"))?;

    let bot_id = match persisted.source {
        MessageSource::Messenger { bot_id } => bot_id,
        MessageSource::Web { .. } => directory
            .bot_for_chat(chat_id)
            .await
            .with_context(|| format!("Failed to resolve bot of chat {chat_id}"))?
            .with_context(|| format!("Chat {chat_id} has no bot"))?,
    };

    let update = BotUpdate::single(bot_id, chat_id, persisted.message);
    Ok(BatchSet::for_recipients(update, recipients))
}

/// Announces stored messages on the notify queue
pub struct MessageNotifier<D, B: Broker> {
    directory: D,
    publisher: NotifyPublisher<B>,
}

impl<D: RecipientDirectory, B: Broker> MessageNotifier<D, B> {
    pub fn new(directory: D, publisher: NotifyPublisher<B>) -> Self {
        Self {
            directory,
            publisher,
        }
    }

    pub fn publisher(&self) -> &NotifyPublisher<B> {
        &self.publisher
    }

    /// Returns whether a batch set was published; a chat without other
    /// subscribers publishes nothing.
    pub async fn on_message_added(&self, persisted: PersistedMessage) -> Result<bool> {
        let chat_id = persisted.chat_id;
        let message_id = persisted.message.id;

        let batch_set = build_batch_set(&self.directory, persisted).await?;
        if batch_set.is_empty() {
            debug!(chat_id, message_id, "No subscribers to notify");
            return Ok(false);
        }

        let published = self
            .publisher
            .publish_batch(&batch_set)
            .await
            .inspect_err(|e| warn!(chat_id, message_id, error = %e, "Failed to announce message"))?;
        Ok(published)
    }
}

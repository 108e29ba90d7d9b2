// ============================================================================
// Update tree levels
// ============================================================================
//
//   BatchSet
//   └── RecipientBatch (user_id)      one per human recipient
//       └── BotUpdate (bot_id)        one per originating bot
//           └── ChatUpdate (chat_id)  one per chat
//               └── Message (id)      in arrival order
//
// Every level is a `MergeTree`, so appending a node whose key already exists
// folds its children into the existing node.
//
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::NotFoundError;
use crate::message::{BotId, ChatId, Message, UserId};
use crate::tree::{Keyed, MergeTree, Mergeable};

// ============================================================================
// ChatUpdate
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUpdate {
    pub chat_id: ChatId,
    #[serde(default)]
    pub messages: MergeTree<Message>,
}

impl ChatUpdate {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            messages: MergeTree::new(),
        }
    }

    pub fn with_messages(chat_id: ChatId, messages: impl IntoIterator<Item = Message>) -> Self {
        Self {
            chat_id,
            messages: messages.into_iter().collect(),
        }
    }

    pub fn append(&mut self, message: Message) {
        self.messages.append(message);
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

impl Keyed for ChatUpdate {
    const KIND: &'static str = "chat";

    fn key(&self) -> i64 {
        self.chat_id
    }
}

impl Mergeable for ChatUpdate {
    fn absorb(&mut self, other: Self) {
        self.messages.append_all(other.messages);
    }
}

// ============================================================================
// BotUpdate
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotUpdate {
    pub bot_id: BotId,
    #[serde(default)]
    pub chats: MergeTree<ChatUpdate>,
}

impl BotUpdate {
    pub fn new(bot_id: BotId) -> Self {
        Self {
            bot_id,
            chats: MergeTree::new(),
        }
    }

    pub fn with_chats(bot_id: BotId, chats: impl IntoIterator<Item = ChatUpdate>) -> Self {
        Self {
            bot_id,
            chats: chats.into_iter().collect(),
        }
    }

    /// One message in one chat, the shape a freshly persisted message takes
    pub fn single(bot_id: BotId, chat_id: ChatId, message: Message) -> Self {
        Self::with_chats(bot_id, [ChatUpdate::with_messages(chat_id, [message])])
    }

    pub fn append(&mut self, chat: ChatUpdate) {
        self.chats.append(chat);
    }

    pub fn contains(&self, chat_id: ChatId) -> bool {
        self.chats.contains(chat_id)
    }

    pub fn get_for(&self, chat_id: ChatId) -> Result<&ChatUpdate, NotFoundError> {
        self.chats.get_for(chat_id)
    }

    pub fn message_count(&self) -> usize {
        self.chats.iter().map(ChatUpdate::message_count).sum()
    }
}

impl Keyed for BotUpdate {
    const KIND: &'static str = "bot";

    fn key(&self) -> i64 {
        self.bot_id
    }
}

impl Mergeable for BotUpdate {
    fn absorb(&mut self, other: Self) {
        self.chats.append_all(other.chats);
    }
}

// ============================================================================
// RecipientBatch
// ============================================================================

/// Everything pending for one human recipient, grouped by bot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientBatch {
    pub user_id: UserId,
    #[serde(default)]
    pub updates: MergeTree<BotUpdate>,
}

impl RecipientBatch {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            updates: MergeTree::new(),
        }
    }

    pub fn with_updates(user_id: UserId, updates: impl IntoIterator<Item = BotUpdate>) -> Self {
        Self {
            user_id,
            updates: updates.into_iter().collect(),
        }
    }

    pub fn append(&mut self, update: BotUpdate) {
        self.updates.append(update);
    }

    pub fn contains(&self, bot_id: BotId) -> bool {
        self.updates.contains(bot_id)
    }

    pub fn get_for(&self, bot_id: BotId) -> Result<&BotUpdate, NotFoundError> {
        self.updates.get_for(bot_id)
    }

    pub fn message_count(&self) -> usize {
        self.updates.iter().map(BotUpdate::message_count).sum()
    }
}

impl Keyed for RecipientBatch {
    const KIND: &'static str = "recipient";

    fn key(&self) -> i64 {
        self.user_id
    }
}

impl Mergeable for RecipientBatch {
    fn absorb(&mut self, other: Self) {
        self.updates.append_all(other.updates);
    }
}

// ============================================================================
// BatchSet
// ============================================================================

/// Top-level container exchanged over the broker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSet {
    #[serde(default)]
    pub updates: MergeTree<RecipientBatch>,
}

impl BatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batches(batches: impl IntoIterator<Item = RecipientBatch>) -> Self {
        Self {
            updates: batches.into_iter().collect(),
        }
    }

    /// Fans one bot update out to every recipient, each getting its own copy
    pub fn for_recipients(update: BotUpdate, recipients: impl IntoIterator<Item = UserId>) -> Self {
        Self::with_batches(
            recipients
                .into_iter()
                .map(|user_id| RecipientBatch::with_updates(user_id, [update.clone()])),
        )
    }

    pub fn append(&mut self, batch: RecipientBatch) {
        self.updates.append(batch);
    }

    pub fn append_all(&mut self, batches: impl IntoIterator<Item = RecipientBatch>) {
        self.updates.append_all(batches);
    }

    /// Merges another batch set into this one, recipient by recipient
    pub fn merge(&mut self, other: BatchSet) {
        self.updates.append_all(other.updates);
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.updates.contains(user_id)
    }

    pub fn get_for(&self, user_id: UserId) -> Result<&RecipientBatch, NotFoundError> {
        self.updates.get_for(user_id)
    }

    pub fn pop_for(&mut self, user_id: UserId) -> Result<RecipientBatch, NotFoundError> {
        self.updates.pop_for(user_id)
    }

    /// Drops a recipient's pending work, e.g. after they unsubscribed
    pub fn remove(&mut self, user_id: UserId) -> bool {
        self.updates.remove(user_id)
    }

    pub fn recipients(&self) -> Vec<UserId> {
        self.updates.keys().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn message_count(&self) -> usize {
        self.updates.iter().map(RecipientBatch::message_count).sum()
    }

    /// JSON body published to the notify queue
    pub fn to_json_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Sender;
    use chrono::{TimeZone, Utc};

    fn message(id: i64) -> Message {
        Message::new(
            id,
            "text",
            Utc.with_ymd_and_hms(2021, 1, 1, 1, 1, 31).unwrap(),
            Sender::new(1, "user"),
        )
    }

    #[test]
    fn test_chat_append_message() {
        let mut chat = ChatUpdate::new(1);
        chat.append(message(1));
        assert_eq!(chat, ChatUpdate::with_messages(1, [message(1)]));
    }

    #[test]
    fn test_chat_append_list() {
        let mut chat = ChatUpdate::new(1);
        chat.messages.extend([message(1), message(2)]);
        assert_eq!(chat, ChatUpdate::with_messages(1, [message(1), message(2)]));
    }

    #[test]
    fn test_same_chat_appends_messages_in_order() {
        let mut update = BotUpdate::with_chats(1, [ChatUpdate::with_messages(1, [message(1)])]);
        update.append(ChatUpdate::with_messages(1, [message(2)]));

        assert_eq!(update.chats.len(), 1);
        let ids: Vec<_> = update.get_for(1).unwrap().messages.keys().collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_bot_update_appends_distinct_chats() {
        let ch1 = ChatUpdate::with_messages(1, [message(1)]);
        let ch2 = ChatUpdate::with_messages(2, [message(2)]);

        let mut update = BotUpdate::new(1);
        update.append(ch1.clone());
        update.append(ch2.clone());

        assert_eq!(update, BotUpdate::with_chats(1, [ch1, ch2]));
    }

    #[test]
    fn test_recipient_batch_keeps_different_bots_apart() {
        let chat = ChatUpdate::with_messages(1, [message(1)]);
        let u1 = BotUpdate::with_chats(1, [chat.clone()]);
        let u2 = BotUpdate::with_chats(2, [chat]);

        let mut batch = RecipientBatch::new(2);
        batch.append(u1.clone());
        batch.append(u2.clone());

        assert_eq!(batch, RecipientBatch::with_updates(2, [u1, u2]));
    }

    #[test]
    fn test_same_bot_disjoint_chats_collapse() {
        let mut batch = RecipientBatch::new(2);
        batch.append(BotUpdate::with_chats(1, [ChatUpdate::new(2)]));
        batch.append(BotUpdate::with_chats(1, [ChatUpdate::new(3)]));

        assert_eq!(batch.updates.len(), 1);
        assert_eq!(
            batch,
            RecipientBatch::with_updates(2, [BotUpdate::with_chats(1, [ChatUpdate::new(2), ChatUpdate::new(3)])])
        );
    }

    #[test]
    fn test_duplicate_message_id_is_dropped() {
        let mut update = BotUpdate::single(1, 10, message(5));
        update.append(ChatUpdate::with_messages(10, [message(5), message(6)]));

        let ids: Vec<_> = update.get_for(10).unwrap().messages.keys().collect();
        assert_eq!(ids, vec![5, 6]);
    }

    #[test]
    fn test_redelivered_batch_set_is_idempotent() {
        let batch = BatchSet::for_recipients(BotUpdate::single(1, 10, message(5)), [7, 8]);

        let mut pending = BatchSet::new();
        pending.merge(batch.clone());
        pending.merge(batch.clone());

        assert_eq!(pending, batch);
        assert_eq!(pending.message_count(), 2);
    }

    #[test]
    fn test_for_recipients_fans_out() {
        let batch = BatchSet::for_recipients(BotUpdate::single(3, 10, message(1)), [7, 8, 7]);

        assert_eq!(batch.recipients(), vec![7, 8]);
        assert_eq!(batch.get_for(8).unwrap().get_for(3).unwrap().message_count(), 1);
        // recipient 7 listed twice, but message id 1 dedups inside its chat
        assert_eq!(batch.get_for(7).unwrap().message_count(), 1);
    }

    #[test]
    fn test_unknown_keys() {
        let mut batch = BatchSet::for_recipients(BotUpdate::single(3, 10, message(1)), [7]);

        assert!(!batch.contains(99));
        assert!(batch.get_for(99).is_err());
        assert_eq!(batch.pop_for(99).unwrap_err(), NotFoundError::new("recipient", 99));

        let recipient = batch.get_for(7).unwrap();
        assert!(!recipient.contains(4));
        assert_eq!(recipient.get_for(4).unwrap_err().kind, "bot");
        assert_eq!(recipient.get_for(3).unwrap().get_for(11).unwrap_err().kind, "chat");
    }

    #[test]
    fn test_remove_recipient() {
        let mut batch = BatchSet::for_recipients(BotUpdate::single(3, 10, message(1)), [7, 8]);

        assert!(batch.remove(7));
        assert!(!batch.remove(7));
        assert_eq!(batch.recipients(), vec![8]);
    }

    #[test]
    fn test_wire_round_trip_preserves_order() {
        let mut batch = BatchSet::new();
        batch.append(RecipientBatch::with_updates(
            9,
            [
                BotUpdate::with_chats(2, [
                    ChatUpdate::with_messages(30, [message(3), message(1)]),
                    ChatUpdate::with_messages(10, [message(2)]),
                ]),
                BotUpdate::single(1, 5, message(4)),
            ],
        ));
        batch.append(RecipientBatch::with_updates(4, [BotUpdate::single(1, 5, message(4))]));

        let bytes = batch.to_json_vec().unwrap();
        let decoded = BatchSet::from_json_slice(&bytes).unwrap();

        assert_eq!(decoded, batch);
        assert_eq!(decoded.recipients(), vec![9, 4]);
        let chat_ids: Vec<_> = decoded.get_for(9).unwrap().get_for(2).unwrap().chats.keys().collect();
        assert_eq!(chat_ids, vec![30, 10]);
    }

    #[test]
    fn test_decodes_documented_payload() {
        let json = r#"{"updates":[{"user_id":2,"updates":[{"bot_id":1,"chats":[{"chat_id":1,
            "messages":[{"id":1,"text":"text","time":"2021-01-01T01:01:31",
            "user":{"id":1,"username":"user"}}]}]}]}]}"#;

        let decoded = BatchSet::from_json_slice(json.as_bytes()).unwrap();
        assert_eq!(decoded, BatchSet::for_recipients(BotUpdate::single(1, 1, message(1)), [2]));
    }

    #[test]
    fn test_decoding_merges_duplicate_keys() {
        let json = r#"{"updates":[
            {"user_id":2,"updates":[{"bot_id":1,"chats":[{"chat_id":1}]}]},
            {"user_id":2,"updates":[{"bot_id":1,"chats":[{"chat_id":2}]}]},
            {"user_id":3}
        ]}"#;

        let decoded = BatchSet::from_json_slice(json.as_bytes()).unwrap();
        assert_eq!(decoded.recipients(), vec![2, 3]);
        let chats: Vec<_> = decoded.get_for(2).unwrap().get_for(1).unwrap().chats.keys().collect();
        assert_eq!(chats, vec![1, 2]);
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        assert!(BatchSet::from_json_slice(b"{\"updates\": [{\"bot_id\": 1}]}").is_err());
        assert!(BatchSet::from_json_slice(b"not json").is_err());
    }
}

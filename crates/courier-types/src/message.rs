use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tree::{Keyed, Mergeable};

pub type MessageId = i64;
pub type ChatId = i64;
pub type BotId = i64;
pub type UserId = i64;

// ============================================================================
// Sender
// ============================================================================

/// Author of a message as shown to the recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// Persistence layer exposes this column as `uid`
    #[serde(alias = "uid")]
    pub id: UserId,
    pub username: String,
}

impl Sender {
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }
}

// ============================================================================
// Message
// ============================================================================

/// A persisted chat message waiting to be shown to a recipient.
///
/// Messages are never mutated once built. Inside a chat they are keyed by
/// `id`: a message whose id is already present is dropped on merge, so a
/// redelivered payload does not show the same message twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    #[serde(with = "timestamp")]
    pub time: DateTime<Utc>,
    pub user: Sender,
}

impl Message {
    pub fn new(id: MessageId, text: impl Into<String>, time: DateTime<Utc>, user: Sender) -> Self {
        Self {
            id,
            text: text.into(),
            time,
            user,
        }
    }
}

impl Keyed for Message {
    const KIND: &'static str = "message";

    fn key(&self) -> i64 {
        self.id
    }
}

impl Mergeable for Message {
    fn absorb(&mut self, _duplicate: Self) {
        // first occurrence wins
    }
}

// ============================================================================
// MessageSource
// ============================================================================

/// Where a persisted message was written, resolved once at ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageSource {
    /// A messenger user wrote to one of the bots
    Messenger { bot_id: BotId },
    /// A web operator answered from the backend
    Web { operator_id: UserId },
}

/// RFC 3339 on output. On input a naive ISO-8601 timestamp (no offset) is
/// also accepted and read as UTC.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
            return Some(time.with_timezone(&Utc));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
            .map(|naive| naive.and_utc())
    }
}

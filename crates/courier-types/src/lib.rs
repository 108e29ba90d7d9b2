// ============================================================================
// Courier Types - Update tree
// ============================================================================
//
// Pure data structures for notification batches: messages grouped by chat,
// chats grouped by bot, bot updates grouped by recipient, and the batch set
// that travels over the broker. No I/O, no broker or database dependencies.
//
// Dependencies:
// - serde / serde_json (wire format)
// - chrono (timestamps)
//
// ============================================================================

pub mod error;
pub mod message;
pub mod tree;
pub mod update;

pub use error::NotFoundError;
pub use message::*;
pub use tree::{Keyed, MergeTree, Mergeable};
pub use update::{BatchSet, BotUpdate, ChatUpdate, RecipientBatch};

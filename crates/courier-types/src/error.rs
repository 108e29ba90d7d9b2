use thiserror::Error;

/// Lookup of a dedup key that is not present in a tree level
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} with id {key} is not present")]
pub struct NotFoundError {
    /// Tree level that was searched ("chat", "bot", "recipient", ...)
    pub kind: &'static str,
    pub key: i64,
}

impl NotFoundError {
    pub fn new(kind: &'static str, key: i64) -> Self {
        Self { kind, key }
    }
}

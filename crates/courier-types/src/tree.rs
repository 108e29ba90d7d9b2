// ============================================================================
// MergeTree - deduplicating, order-preserving child container
// ============================================================================
//
// Every level of the update tree (messages in a chat, chats in a bot update,
// bot updates in a recipient batch, recipient batches in a batch set) is a
// MergeTree instantiated with a different child type. The child type decides
// its dedup key (`Keyed`) and how an incoming duplicate is folded into the
// existing node (`Mergeable`).
//
// Invariants:
// - at most one child per key
// - children keep the order in which their key was first seen
// - merging never drops the incoming node's children
//
// Children counts are small (active chats/bots per burst), so lookups are a
// linear scan.
//
// ============================================================================

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::NotFoundError;

/// A node identified by a dedup key
pub trait Keyed {
    /// Node kind reported in [`NotFoundError`]
    const KIND: &'static str;

    fn key(&self) -> i64;
}

/// A node that can absorb another node carrying the same key
pub trait Mergeable: Keyed {
    /// Fold `other` (same key as `self`) into `self`
    fn absorb(&mut self, other: Self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeTree<T> {
    items: Vec<T>,
}

impl<T> Default for MergeTree<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> MergeTree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }

    /// Removes every child, returning them in order
    pub fn take(&mut self) -> Vec<T> {
        std::mem::take(&mut self.items)
    }
}

impl<T: Keyed> MergeTree<T> {
    fn position(&self, key: i64) -> Option<usize> {
        self.items.iter().position(|item| item.key() == key)
    }

    pub fn contains(&self, key: i64) -> bool {
        self.position(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = i64> + '_ {
        self.items.iter().map(|item| item.key())
    }

    /// Child with `key`, or `None` when absence is a routine outcome
    pub fn find(&self, key: i64) -> Option<&T> {
        self.items.iter().find(|item| item.key() == key)
    }

    pub fn find_mut(&mut self, key: i64) -> Option<&mut T> {
        self.items.iter_mut().find(|item| item.key() == key)
    }

    pub fn get_for(&self, key: i64) -> Result<&T, NotFoundError> {
        self.find(key).ok_or_else(|| NotFoundError::new(T::KIND, key))
    }

    pub fn get_mut_for(&mut self, key: i64) -> Result<&mut T, NotFoundError> {
        self.find_mut(key).ok_or_else(|| NotFoundError::new(T::KIND, key))
    }

    /// Removes and returns the child with `key`
    pub fn pop_for(&mut self, key: i64) -> Result<T, NotFoundError> {
        self.try_pop_for(key).ok_or_else(|| NotFoundError::new(T::KIND, key))
    }

    pub fn try_pop_for(&mut self, key: i64) -> Option<T> {
        self.position(key).map(|idx| self.items.remove(idx))
    }

    /// Drops the child with `key`; returns whether anything was removed
    pub fn remove(&mut self, key: i64) -> bool {
        self.try_pop_for(key).is_some()
    }
}

impl<T: Mergeable> MergeTree<T> {
    /// Merges one child: absorbed into the existing node with the same key,
    /// otherwise pushed to the end.
    pub fn append(&mut self, child: T) {
        match self.position(child.key()) {
            Some(idx) => self.items[idx].absorb(child),
            None => self.items.push(child),
        }
    }

    /// Merges every child in iteration order
    pub fn append_all<I>(&mut self, children: I)
    where
        I: IntoIterator<Item = T>,
    {
        for child in children {
            self.append(child);
        }
    }
}

impl<T: Mergeable> Extend<T> for MergeTree<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.append_all(iter);
    }
}

impl<T: Mergeable> FromIterator<T> for MergeTree<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut tree = Self::new();
        tree.append_all(iter);
        tree
    }
}

impl<T: Mergeable> From<Vec<T>> for MergeTree<T> {
    fn from(items: Vec<T>) -> Self {
        items.into_iter().collect()
    }
}

impl<T> IntoIterator for MergeTree<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a MergeTree<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

// On the wire a tree is a plain JSON array. Decoding goes through `append`,
// so duplicate keys in a payload are merged instead of kept side by side.

impl<T: Serialize> Serialize for MergeTree<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.items.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for MergeTree<T>
where
    T: Deserialize<'de> + Mergeable,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<T>::deserialize(deserializer).map(Self::from)
    }
}

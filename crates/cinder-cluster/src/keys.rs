//! Slot-to-keys index.
//!
//! The storage engine reports every key it creates or deletes, and the
//! cluster layer uses the index to answer "is this key still here?" during
//! migrations and to list or drop the keys of one slot.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::slots::key_slot;

/// Keys grouped by slot, each group kept sorted.
#[derive(Debug, Clone, Default)]
pub struct SlotKeyIndex {
    slots: BTreeMap<u16, BTreeSet<Bytes>>,
    total: usize,
}

impl SlotKeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a key. Returns false if it was already present.
    pub fn insert(&mut self, key: Bytes) -> bool {
        let added = self.slots.entry(key_slot(&key)).or_default().insert(key);
        if added {
            self.total += 1;
        }
        added
    }

    /// Forgets a key. Returns false if it wasn't present.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let slot = key_slot(key);
        let Some(keys) = self.slots.get_mut(&slot) else {
            return false;
        };
        let removed = keys.remove(key);
        if keys.is_empty() {
            self.slots.remove(&slot);
        }
        if removed {
            self.total -= 1;
        }
        removed
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.slots
            .get(&key_slot(key))
            .is_some_and(|keys| keys.contains(key))
    }

    pub fn count_in_slot(&self, slot: u16) -> usize {
        self.slots.get(&slot).map_or(0, BTreeSet::len)
    }

    /// Returns up to `limit` keys of a slot in sorted order.
    pub fn keys_in_slot(&self, slot: u16, limit: usize) -> Vec<Bytes> {
        self.slots
            .get(&slot)
            .map(|keys| keys.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Removes every key of a slot, returning them.
    pub fn drain_slot(&mut self, slot: u16) -> Vec<Bytes> {
        let keys: Vec<Bytes> = self
            .slots
            .remove(&slot)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default();
        self.total -= keys.len();
        keys
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

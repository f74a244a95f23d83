//! Inventory: the set of unexpired object identifiers known to this node
//! (spec.md §3's "Inventory entry", §2's "Inventory" component).

use bitmessage_core::object::{InventoryVector, ObjectMessage};
use parking_lot::RwLock;
use std::collections::HashMap;

/// A stored object together with the stream it was accepted on and when it
/// expires.
#[derive(Clone, Debug)]
pub struct InventoryEntry {
    pub stream: u64,
    pub expires_time: i64,
    pub object: ObjectMessage,
}

/// Port over the inventory: the authoritative set of objects this node
/// relays. A real deployment backs this with a persistent store;
/// persistence itself is an external concern here.
pub trait Inventory: Send + Sync {
    /// Insert an object if its IV is not already present. Returns `true` if
    /// this call newly stored it (the caller should advertise it);
    /// `false` means a duplicate, already-stored object (the caller must
    /// not notify or re-advertise).
    fn insert(&self, iv: InventoryVector, entry: InventoryEntry) -> bool;

    fn contains(&self, iv: &InventoryVector) -> bool;

    fn get(&self, iv: &InventoryVector) -> Option<InventoryEntry>;

    /// All IVs on `stream`, for building an `inv` message.
    fn ivs_for_stream(&self, stream: u64) -> Vec<InventoryVector>;

    /// Remove every entry with `expires_time <= now`, returning how many
    /// were evicted.
    fn evict_expired(&self, now: i64) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory [`Inventory`], suitable for tests and as the default store
/// when no persistent backing is configured.
#[derive(Default)]
pub struct InMemoryInventory {
    entries: RwLock<HashMap<InventoryVector, InventoryEntry>>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inventory for InMemoryInventory {
    fn insert(&self, iv: InventoryVector, entry: InventoryEntry) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&iv) {
            return false;
        }
        entries.insert(iv, entry);
        true
    }

    fn contains(&self, iv: &InventoryVector) -> bool {
        self.entries.read().contains_key(iv)
    }

    fn get(&self, iv: &InventoryVector) -> Option<InventoryEntry> {
        self.entries.read().get(iv).cloned()
    }

    fn ivs_for_stream(&self, stream: u64) -> Vec<InventoryVector> {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.stream == stream)
            .map(|(iv, _)| *iv)
            .collect()
    }

    fn evict_expired(&self, now: i64) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_time > now);
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitmessage_core::object::ObjectType;

    fn sample(iv_seed: u8, stream: u64, expires_time: i64) -> (InventoryVector, InventoryEntry) {
        let object = ObjectMessage {
            nonce: [0u8; 8],
            expires_time,
            object_type: ObjectType::Unknown(999),
            version: 1,
            stream,
            payload: vec![iv_seed],
        };
        (object.inventory_vector(), InventoryEntry { stream, expires_time, object })
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let inventory = InMemoryInventory::new();
        let (iv, entry) = sample(1, 1, 1_000);
        assert!(inventory.insert(iv, entry.clone()));
        assert!(!inventory.insert(iv, entry));
        assert_eq!(inventory.len(), 1);
    }

    #[test]
    fn ivs_for_stream_filters_correctly() {
        let inventory = InMemoryInventory::new();
        let (iv1, e1) = sample(1, 1, 1_000);
        let (iv2, e2) = sample(2, 2, 1_000);
        inventory.insert(iv1, e1);
        inventory.insert(iv2, e2);

        let stream_one = inventory.ivs_for_stream(1);
        assert_eq!(stream_one, vec![iv1]);
    }

    #[test]
    fn evict_expired_removes_only_past_entries() {
        let inventory = InMemoryInventory::new();
        let (iv_old, e_old) = sample(1, 1, 100);
        let (iv_new, e_new) = sample(2, 1, 10_000);
        inventory.insert(iv_old, e_old);
        inventory.insert(iv_new, e_new);

        let evicted = inventory.evict_expired(5_000);
        assert_eq!(evicted, 1);
        assert!(!inventory.contains(&iv_old));
        assert!(inventory.contains(&iv_new));
    }
}

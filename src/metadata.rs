//! Per-request metadata pool.
//!
//! Nodes read and write tag-keyed blobs scoped to a request slot and
//! publish tags once their values are final. The pool does not interpret
//! the data.

use crate::pipeline::id::NodeId;
use crate::sync::lock;
use std::collections::HashMap;
use std::sync::Mutex;

/// Tag a node publishes when it has finished a request.
pub fn node_complete_tag(node: NodeId) -> u32 {
    0x8000_0000 | node.0
}

/// Tag-keyed storage scoped to a request slot.
pub trait MetadataPool: Send + Sync {
    fn set(&self, slot: usize, tag: u32, value: Vec<u8>);
    fn get(&self, slot: usize, tag: u32) -> Option<Vec<u8>>;
    fn publish(&self, slot: usize, tag: u32);
    fn is_published(&self, slot: usize, tag: u32) -> bool;
    /// Forget everything stored for a slot before it is reused
    fn reset_slot(&self, slot: usize);
}

#[derive(Debug, Default)]
struct Entry {
    value: Vec<u8>,
    published: bool,
}

/// Hash map backed pool with one map per slot.
pub struct InMemoryMetadataPool {
    slots: Vec<Mutex<HashMap<u32, Entry>>>,
}

impl InMemoryMetadataPool {
    pub fn new(depth: usize) -> Self {
        Self {
            slots: (0..depth.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn slot(&self, slot: usize) -> &Mutex<HashMap<u32, Entry>> {
        &self.slots[slot % self.slots.len()]
    }

    pub fn published_tags(&self, slot: usize) -> Vec<u32> {
        let mut tags: Vec<u32> = lock(self.slot(slot))
            .iter()
            .filter(|(_, e)| e.published)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        tags
    }
}

impl MetadataPool for InMemoryMetadataPool {
    fn set(&self, slot: usize, tag: u32, value: Vec<u8>) {
        lock(self.slot(slot)).entry(tag).or_default().value = value;
    }

    fn get(&self, slot: usize, tag: u32) -> Option<Vec<u8>> {
        lock(self.slot(slot)).get(&tag).map(|e| e.value.clone())
    }

    fn publish(&self, slot: usize, tag: u32) {
        lock(self.slot(slot)).entry(tag).or_default().published = true;
    }

    fn is_published(&self, slot: usize, tag: u32) -> bool {
        lock(self.slot(slot))
            .get(&tag)
            .is_some_and(|e| e.published)
    }

    fn reset_slot(&self, slot: usize) {
        lock(self.slot(slot)).clear();
    }
}

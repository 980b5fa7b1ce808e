//! Registry of durable snapshots: pinned generation → searcher version.

use std::collections::BTreeSet;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Identifies one durable snapshot of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId {
    pub index_generation: u64,
    pub taxonomy_generation: u64,
    /// Searcher version serving the snapshotted commit.
    pub version: u64,
}

/// Versions in this registry are never evicted from the version cache.
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    entries: RwLock<AHashMap<u64, u64>>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `version` under `generation`, returning the version it replaces.
    pub fn insert(&self, generation: u64, version: u64) -> Option<u64> {
        self.entries.write().insert(generation, version)
    }

    pub fn remove(&self, generation: u64) -> Option<u64> {
        self.entries.write().remove(&generation)
    }

    pub fn get(&self, generation: u64) -> Option<u64> {
        self.entries.read().get(&generation).copied()
    }

    /// The set of currently pinned versions.
    pub fn versions(&self) -> BTreeSet<u64> {
        self.entries.read().values().copied().collect()
    }

    /// Every `(generation, version)` pair, ordered by generation.
    pub fn entries(&self) -> Vec<(u64, u64)> {
        let mut entries: Vec<(u64, u64)> =
            self.entries.read().iter().map(|(g, v)| (*g, *v)).collect();
        entries.sort_unstable();
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Object identifier, shared by databases, tablespaces, files, and tables.
pub type Oid = u32;

/// Worker node identifier within the cluster.
pub type NodeId = i16;

/// Reserved node id meaning "cluster-wide total", never a real node.
pub const SUMMARY_NODE_ID: NodeId = -1;

/// Object ids below this belong to system objects and are never tracked.
pub const FIRST_USER_OBJECT_ID: Oid = 16384;

/// Identifies one physical storage file. Distinct from the logical table
/// identifier: a single table owns many files (forks, indexes, partitions),
/// and the mapping back to the table is only resolvable during harvest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActiveFileKey {
    pub database_id: Oid,
    pub tablespace_id: Oid,
    pub file_id: Oid,
}

#[derive(Debug, Clone)]
pub struct ActiveFileRegistryConfig {
    /// Hard cap on tracked entries. Inserts past this are dropped, not queued.
    pub max_entries: usize,
}

impl Default for ActiveFileRegistryConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024 * 1024,
        }
    }
}

/// Bounded set of files whose size changed since the last harvest.
///
/// Shared by every mutation detector on the node and drained once per cycle
/// by the harvester. This is a deliberately lossy structure: when full, new
/// keys are refused rather than evicted. A dropped file keeps mutating as it
/// grows, so a later event re-offers it and the registry self-heals.
#[derive(Debug)]
pub struct ActiveFileRegistry {
    config: ActiveFileRegistryConfig,
    entries: Mutex<HashSet<ActiveFileKey>>,
}

impl ActiveFileRegistry {
    pub fn new(config: ActiveFileRegistryConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashSet::new()),
        }
    }

    /// Insert or refresh a key. Returns `false` when a brand-new key was
    /// refused because the registry is full; refreshing a key that is
    /// already present always succeeds and does not count against capacity.
    pub fn upsert(&self, key: ActiveFileKey) -> bool {
        if self.offer(key) {
            return true;
        }
        warn!(
            "active file registry is full ({} entries); file {}/{}/{} not tracked this cycle",
            self.config.max_entries, key.database_id, key.tablespace_id, key.file_id
        );
        false
    }

    /// Silent variant of `upsert` used when requeueing unresolved files.
    pub fn restore(&self, key: ActiveFileKey) -> bool {
        self.offer(key)
    }

    fn offer(&self, key: ActiveFileKey) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains(&key) {
            return true;
        }
        if entries.len() >= self.config.max_entries {
            return false;
        }
        entries.insert(key);
        true
    }

    /// Exact-key delete; no-op when absent.
    pub fn remove(&self, key: &ActiveFileKey) {
        self.entries.lock().remove(key);
    }

    /// Atomically remove and return every entry belonging to one database.
    /// Entries of other databases stay untouched.
    pub fn drain_for_database(&self, database_id: Oid) -> Vec<ActiveFileKey> {
        let mut entries = self.entries.lock();
        let drained: Vec<ActiveFileKey> = entries
            .iter()
            .filter(|key| key.database_id == database_id)
            .copied()
            .collect();
        for key in &drained {
            entries.remove(key);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

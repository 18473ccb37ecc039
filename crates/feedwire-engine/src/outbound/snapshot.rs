//! Recently delivered collections, keyed by content hash.
//!
//! When a client probes with a hash the server no longer matches, a
//! remembered snapshot for that hash is the exact state the client holds and
//! can be diffed against.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;

/// Bounded LRU of delivered collections.
pub struct SnapshotMemory {
    entries: Mutex<LruCache<String, Arc<Vec<Value>>>>,
}

impl SnapshotMemory {
    /// Memory holding up to `capacity` snapshots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Remember the collection delivered under `hash`.
    pub fn remember(&self, hash: String, items: Vec<Value>) {
        let _ = self.entries.lock().put(hash, Arc::new(items));
    }

    /// Collection delivered under `hash`, refreshing its recency.
    pub fn get(&self, hash: &str) -> Option<Arc<Vec<Value>>> {
        self.entries.lock().get(hash).cloned()
    }

    /// Number of remembered snapshots.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

//! Partitioned subscriber index of one outbound.

use std::collections::HashMap;
use std::sync::Arc;

use feedwire_core::ConnectionId;
use parking_lot::Mutex;

use crate::connection::Connection;
use crate::filter::PartitionKey;

type Members = HashMap<ConnectionId, Arc<Connection>>;

/// Subscribers bucketed by partition. `None` is the unfiltered partition.
#[derive(Default)]
pub struct Subscriptions {
    partitions: Mutex<HashMap<Option<PartitionKey>, Members>>,
}

impl Subscriptions {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a partition. Returns `false` if already a member.
    pub fn add(&self, key: Option<PartitionKey>, connection: &Arc<Connection>) -> bool {
        self.partitions
            .lock()
            .entry(key)
            .or_default()
            .insert(connection.id(), Arc::clone(connection))
            .is_none()
    }

    /// Remove a connection from every partition, dropping emptied
    /// partitions. Returns the number of memberships removed.
    pub fn remove(&self, id: ConnectionId) -> usize {
        let mut partitions = self.partitions.lock();
        let mut removed = 0;
        partitions.retain(|_, members| {
            if members.remove(&id).is_some() {
                removed += 1;
            }
            !members.is_empty()
        });
        removed
    }

    /// Snapshot of a partition's members.
    pub fn members(&self, key: Option<&PartitionKey>) -> Vec<Arc<Connection>> {
        self.partitions
            .lock()
            .get(&key.cloned())
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a connection is in a partition.
    pub fn contains(&self, key: Option<&PartitionKey>, id: ConnectionId) -> bool {
        self.partitions
            .lock()
            .get(&key.cloned())
            .is_some_and(|members| members.contains_key(&id))
    }

    /// Number of partitions a connection belongs to.
    pub fn membership_count(&self, id: ConnectionId) -> usize {
        self.partitions
            .lock()
            .values()
            .filter(|members| members.contains_key(&id))
            .count()
    }

    /// Number of non-empty partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.lock().len()
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.partitions.lock().clear();
    }
}

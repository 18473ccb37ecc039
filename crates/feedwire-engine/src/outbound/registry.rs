//! Outbound registry and multi-feed delivery.

use std::collections::HashMap;
use std::sync::Arc;

use feedwire_settings::EngineSettings;
use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use super::{Delivery, Outbound, OutboundConfig};
use crate::connection::Connection;
use crate::errors::{EngineError, Result};
use crate::filter::PartitionKey;
use crate::route::validate_method;

#[derive(Default)]
struct OutboundTable {
    by_method: HashMap<String, Arc<Outbound>>,
    order: Vec<Arc<Outbound>>,
}

/// Registered outbounds, in registration order.
pub struct OutboundRegistry {
    table: RwLock<OutboundTable>,
    settings: EngineSettings,
}

impl OutboundRegistry {
    /// Empty registry.
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            table: RwLock::new(OutboundTable::default()),
            settings,
        }
    }

    /// Engine settings applied to every outbound.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Freeze and register an outbound.
    pub fn add_outbound(&self, config: OutboundConfig) -> Result<Arc<Outbound>> {
        validate_method(config.method())?;
        let mut table = self.table.write();
        if table.by_method.contains_key(config.method()) {
            return Err(EngineError::DuplicateOutbound {
                method: config.method().to_owned(),
            });
        }
        let outbound = Arc::new(config.freeze(
            self.settings.cache_enabled,
            self.settings.snapshot_memory,
        ));
        let _ = table
            .by_method
            .insert(outbound.method().to_owned(), Arc::clone(&outbound));
        table.order.push(Arc::clone(&outbound));
        debug!(method = %outbound.method(), lazy = outbound.is_lazy(), "outbound registered");
        Ok(outbound)
    }

    /// Outbound by method.
    pub fn get(&self, method: &str) -> Result<Arc<Outbound>> {
        self.table
            .read()
            .by_method
            .get(method)
            .cloned()
            .ok_or_else(|| EngineError::OutboundNotFound {
                method: method.to_owned(),
            })
    }

    /// Every outbound, in registration order.
    pub fn list(&self) -> Vec<Arc<Outbound>> {
        self.table.read().order.clone()
    }

    /// Number of registered outbounds.
    pub fn len(&self) -> usize {
        self.table.read().order.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.table.read().order.is_empty()
    }

    /// Drop every outbound with its subscriptions and snapshots.
    pub fn clear(&self) {
        let table = std::mem::take(&mut *self.table.write());
        for outbound in table.order {
            outbound.subscriptions().clear();
            outbound.snapshots().clear();
        }
    }

    /// Push every eager outbound to a new connection, each delivery
    /// independent of the others.
    #[instrument(skip_all, fields(conn_id = %connection.id()))]
    pub async fn send_to_connection(&self, connection: &Arc<Connection>) {
        let eager: Vec<_> = self.list().into_iter().filter(|o| !o.is_lazy()).collect();
        let deliveries = eager.iter().map(|outbound| async move {
            if let Err(err) = outbound.send_to(connection, None).await {
                outbound.log_failure(connection, &err);
            }
        });
        let _ = join_all(deliveries).await;
    }

    /// Refresh one outbound's subscribers in a partition.
    pub async fn send_updated_data(&self, method: &str, key: Option<&PartitionKey>) -> Result<usize> {
        let outbound = self.get(method)?;
        Ok(outbound.send_updated_data(key).await)
    }

    /// Refresh several outbounds. The first is awaited; the rest run in the
    /// background.
    pub async fn send_updates(self: &Arc<Self>, methods: &[String], key: Option<PartitionKey>) {
        let Some((first, rest)) = methods.split_first() else {
            return;
        };
        self.update_logged(first, key.as_ref()).await;
        for method in rest {
            let registry = Arc::clone(self);
            let method = method.clone();
            let key = key.clone();
            let _ = tokio::spawn(async move {
                registry.update_logged(&method, key.as_ref()).await;
            });
        }
    }

    async fn update_logged(&self, method: &str, key: Option<&PartitionKey>) {
        match self.send_updated_data(method, key).await {
            Ok(delivered) => debug!(method, delivered, "outbound refreshed"),
            Err(err) => warn!(method, error = %err, "outbound refresh skipped"),
        }
    }

    /// Remove a connection from every outbound's subscriptions.
    pub fn unsubscribe_connection(&self, connection: &Connection) -> usize {
        self.list()
            .iter()
            .map(|outbound| outbound.subscriptions().remove(connection.id()))
            .sum()
    }

    /// Re-deliver auth-sensitive outbounds after the connection's auth state
    /// changed. Lazy outbounds the client never requested are skipped; feeds
    /// the connection may no longer see are revoked.
    #[instrument(skip_all, fields(conn_id = %connection.id()))]
    pub async fn resend_after_authentication_change(&self, connection: &Arc<Connection>) {
        let targets: Vec<_> = self
            .list()
            .into_iter()
            .filter(|o| o.resends_after_authentication_change())
            .filter(|o| !o.is_lazy() || connection.has_request_config(o.method()))
            .collect();
        debug!(outbounds = targets.len(), "re-delivering after authentication change");

        let deliveries = targets.iter().map(|outbound| async move {
            match outbound.send_to(connection, None).await {
                Ok(Delivery::Unauthorized) => outbound.revoke(connection),
                Ok(_) => {}
                Err(err) => outbound.log_failure(connection, &err),
            }
        });
        let _ = join_all(deliveries).await;
    }
}

impl std::fmt::Debug for OutboundRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundRegistry")
            .field("outbounds", &self.len())
            .finish_non_exhaustive()
    }
}

//! Delivery operations of an outbound.
//!
//! Every path ends in one of the [`Delivery`] outcomes. Caching only applies
//! when the outbound, the engine and the connection all support it; then a
//! connection's baseline and the snapshot memory track what the client holds.

use std::sync::Arc;

use feedwire_core::HandlerError;
use feedwire_core::frame::Frame;
use feedwire_core::hash::items_hash;
use futures::future::join_all;
use metrics::counter;
use serde_json::{Value, json};
use tracing::{debug, error, instrument, trace};

use super::diff::{self, Diff};
use super::{CacheProbe, Delivery, Outbound};
use crate::connection::{Connection, RequestConfig};
use crate::errors::{EngineError, Result};
use crate::filter::PartitionKey;
use crate::handler::FeedData;

struct Fetched {
    items: Vec<Value>,
    total_length: Option<u64>,
}

impl Outbound {
    /// Whether the cache-probe protocol is active between this feed and
    /// `connection`.
    pub fn cache_active(&self, connection: &Connection) -> bool {
        self.supports_cache() && connection.supports_cache()
    }

    /// Deliver to one connection.
    ///
    /// A config stores the requested page size for later updates. A request
    /// for a single `id`, or a connection without caching, fetches and sends
    /// right away; otherwise a cache probe goes out and the data follows the
    /// client's `___cache` reply.
    #[instrument(skip_all, fields(method = %self.method, conn_id = %connection.id()))]
    pub async fn send_to(
        &self,
        connection: &Arc<Connection>,
        config: Option<RequestConfig>,
    ) -> Result<Delivery> {
        let id = config.and_then(|config| {
            if config.id.is_none() || config.count.is_some() {
                connection.set_request_config(
                    &self.method,
                    RequestConfig {
                        id: None,
                        count: config.count,
                    },
                );
            }
            config.id
        });

        if id.is_some() || !self.cache_active(connection) {
            return self.send_data(connection, id).await;
        }
        Ok(self.emit(connection, &Frame::cache_probe(&self.method), Delivery::CacheProbe))
    }

    /// Fetch and deliver, bypassing the cache probe.
    pub async fn send_data(
        &self,
        connection: &Arc<Connection>,
        id: Option<Value>,
    ) -> Result<Delivery> {
        let Some(fetched) = self.fetch(connection, id.clone()).await? else {
            return Ok(Delivery::Unauthorized);
        };
        if let Some(id) = id {
            return Ok(self.send_single(connection, &id, fetched));
        }
        self.subscribe(connection, &fetched.items).await;
        self.deliver(connection, fetched).await
    }

    /// Answer a client's `___cache` reply.
    #[instrument(skip_all, fields(method = %self.method, conn_id = %connection.id()))]
    pub async fn handle_cache_probe(
        &self,
        connection: &Arc<Connection>,
        probe: CacheProbe,
    ) -> Result<Delivery> {
        let Some(prior) = probe.specific_hash.filter(|hash| !hash.is_empty()) else {
            return self.send_data(connection, None).await;
        };
        if !self.cache_active(connection) {
            return self.send_data(connection, None).await;
        }
        if let Some(current) = self.current_global_hash().await {
            if probe.global_hash.as_deref() != Some(current.as_str()) {
                debug!("global hash changed, sending full data");
                return self.send_data(connection, None).await;
            }
        }
        self.send_to_if_content_changed(connection, &prior).await
    }

    /// Fetch and compare against the hash the client holds.
    ///
    /// An equal hash restores the client's cache. Otherwise the client gets a
    /// diff against the snapshot it holds; an unknown hash clears the client
    /// cache first and the diff inserts everything.
    pub async fn send_to_if_content_changed(
        &self,
        connection: &Arc<Connection>,
        prior_hash: &str,
    ) -> Result<Delivery> {
        let Some(fetched) = self.fetch(connection, None).await? else {
            return Ok(Delivery::Unauthorized);
        };
        self.subscribe(connection, &fetched.items).await;

        let specific = items_hash(&fetched.items);
        if specific == prior_hash {
            connection.set_baseline(&self.method, fetched.items.clone());
            self.snapshots.remember(specific, fetched.items);
            return Ok(self.emit(
                connection,
                &Frame::cache_restore(&self.method),
                Delivery::CacheRestore,
            ));
        }

        let changes = match self.snapshots.get(prior_hash) {
            Some(snapshot) => diff::diff(&fetched.items, &snapshot).ok(),
            None => {
                debug!("probed hash unknown, clearing client cache");
                let _ = connection.send(&Frame::cache_delete(&self.method));
                Some(Diff::insert_all(&fetched.items))
            }
        };
        let Some(changes) = changes else {
            return Ok(self.send_full(connection, fetched, true).await);
        };

        connection.set_baseline(&self.method, fetched.items.clone());
        self.snapshots.remember(specific.clone(), fetched.items);
        let frame = Frame::diff(&self.method, changes.inserted, changes.updated, changes.deleted)
            .with_hashes(self.current_global_hash().await, Some(specific))
            .with_length(fetched.total_length);
        Ok(self.emit(connection, &frame, Delivery::Diff))
    }

    /// Refresh the subscribers of a partition (every subscriber for `None`
    /// or when the feed updates all subscribers). Returns how many received
    /// a frame.
    #[instrument(skip_all, fields(method = %self.method, partition = ?key))]
    pub async fn send_updated_data(&self, key: Option<&PartitionKey>) -> usize {
        let key = if self.update_all_subscribers { None } else { key };
        let targets = self.subscriptions.members(key);
        debug!(recipients = targets.len(), "refreshing subscribers");

        let deliveries = targets.iter().map(|connection| self.refresh(connection));
        join_all(deliveries)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }

    /// Withdraw the feed from a connection that lost access.
    pub fn revoke(&self, connection: &Connection) {
        trace!(method = %self.method, conn_id = %connection.id(), "revoking feed");
        let _ = connection.clear_baseline(&self.method);
        let _ = self.subscriptions.remove(connection.id());
        let _ = connection.send(&Frame::data_delete(&self.method));
    }

    /// Record a failed delivery.
    pub(crate) fn log_failure(&self, connection: &Connection, err: &EngineError) {
        counter!("outbound_delivery_failures_total", "method" => self.method.clone()).increment(1);
        if err.is_logged() {
            error!(method = %self.method, conn_id = %connection.id(), error = %err, "outbound delivery failed");
        } else {
            trace!(method = %self.method, conn_id = %connection.id(), error = %err, "outbound delivery declined");
        }
    }

    async fn refresh(&self, connection: &Arc<Connection>) -> bool {
        if connection.is_closed() {
            let _ = self.subscriptions.remove(connection.id());
            return false;
        }
        match self.send_data(connection, None).await {
            Ok(Delivery::Unauthorized) => {
                self.revoke(connection);
                false
            }
            Ok(delivery) => !matches!(delivery, Delivery::Dropped | Delivery::Unchanged),
            Err(err) => {
                self.log_failure(connection, &err);
                false
            }
        }
    }

    async fn fetch(&self, connection: &Arc<Connection>, id: Option<Value>) -> Result<Option<Fetched>> {
        let config = connection.request_config(&self.method);
        if let Some(authenticator) = &self.authenticator {
            let payload = json!({"id": id, "count": config.count});
            if !authenticator.check_authentication(connection, &payload).await {
                trace!(method = %self.method, conn_id = %connection.id(), "delivery rejected by authenticator");
                return Ok(None);
            }
        }

        let data = match self.producer.produce(Arc::clone(connection), config.count, id).await {
            Ok(data) => data,
            Err(HandlerError::Unauthorized) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(match data {
            FeedData::Items(items) => Some(Fetched {
                items,
                total_length: None,
            }),
            FeedData::Partial(page) => Some(Fetched {
                items: page.items,
                total_length: Some(page.total_length),
            }),
            FeedData::Unauthorized => None,
        })
    }

    fn send_single(&self, connection: &Connection, id: &Value, fetched: Fetched) -> Delivery {
        let total = fetched
            .total_length
            .unwrap_or_else(|| u64::try_from(fetched.items.len()).unwrap_or(u64::MAX));
        let wanted = diff::identity_key(id);
        let inserted: Vec<Value> = fetched
            .items
            .into_iter()
            .find(|item| wanted.is_some() && diff::identity(item) == wanted)
            .into_iter()
            .collect();

        if self.partial_updates && !inserted.is_empty() {
            connection.update_baseline(&self.method, |baseline| diff::upsert(baseline, &inserted));
        }
        let frame = Frame::diff(&self.method, inserted, Vec::new(), Vec::new()).with_length(Some(total));
        self.emit(connection, &frame, Delivery::Diff)
    }

    async fn subscribe(&self, connection: &Arc<Connection>, items: &[Value]) {
        let _ = self.subscriptions.add(None, connection);
        if !self.filters.is_empty() {
            let response = Value::Array(items.to_vec());
            for filter in &self.filters {
                if let Some(key) = filter.partition(&response, connection).await {
                    let _ = self.subscriptions.add(Some(key), connection);
                }
            }
        }
        // A close racing the subscription must not leave memberships behind.
        if connection.is_closed() {
            let _ = self.subscriptions.remove(connection.id());
        }
    }

    async fn deliver(&self, connection: &Connection, fetched: Fetched) -> Result<Delivery> {
        let cache = self.cache_active(connection);
        if self.partial_updates && cache {
            if let Some(baseline) = connection.baseline(&self.method) {
                let changes = diff::diff(&fetched.items, &baseline).map_err(|_| {
                    EngineError::MissingIdentity {
                        method: self.method.clone(),
                    }
                })?;
                return Ok(self.send_changes(connection, changes, fetched).await);
            }
        }
        Ok(self.send_full(connection, fetched, cache).await)
    }

    async fn send_changes(&self, connection: &Connection, changes: Diff, fetched: Fetched) -> Delivery {
        connection.update_baseline(&self.method, |baseline| diff::apply(baseline, &changes));
        let specific = items_hash(&fetched.items);
        self.snapshots.remember(specific.clone(), fetched.items);
        if changes.is_empty() {
            return Delivery::Unchanged;
        }
        let frame = Frame::diff(&self.method, changes.inserted, changes.updated, changes.deleted)
            .with_hashes(self.current_global_hash().await, Some(specific))
            .with_length(fetched.total_length);
        self.emit(connection, &frame, Delivery::Diff)
    }

    async fn send_full(&self, connection: &Connection, fetched: Fetched, cache: bool) -> Delivery {
        let Fetched {
            items,
            total_length,
        } = fetched;
        let (global, specific) = if cache {
            let specific = items_hash(&items);
            self.snapshots.remember(specific.clone(), items.clone());
            connection.set_baseline(&self.method, items.clone());
            (self.current_global_hash().await, Some(specific))
        } else {
            (None, None)
        };
        let frame = Frame::data(&self.method, items)
            .with_hashes(global, specific)
            .with_length(total_length);
        self.emit(connection, &frame, Delivery::Full)
    }

    async fn current_global_hash(&self) -> Option<String> {
        match &self.global_hash {
            Some(provider) => provider.global_hash().await,
            None => None,
        }
    }

    fn emit(&self, connection: &Connection, frame: &Frame, delivery: Delivery) -> Delivery {
        if connection.send(frame) {
            counter!(
                "outbound_deliveries_total",
                "method" => self.method.clone(),
                "mode" => delivery.as_str()
            )
            .increment(1);
            delivery
        } else {
            debug!(method = %self.method, conn_id = %connection.id(), "frame dropped");
            Delivery::Dropped
        }
    }
}

//! Named server-to-client data feeds.
//!
//! An outbound is configured with [`OutboundConfig`] and frozen into an
//! [`Outbound`] when registered with the [`OutboundRegistry`]. Delivery logic
//! lives in `delivery`; the subscriber index, identity diff and snapshot
//! memory are separate submodules.

mod delivery;
pub mod diff;
pub mod partition;
mod registry;
pub mod snapshot;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::auth::Authenticator;
use crate::filter::MessageFilter;
use crate::handler::Producer;
use partition::Subscriptions;
use snapshot::SnapshotMemory;

pub use registry::OutboundRegistry;

/// Coarse invalidation fingerprint of an outbound.
#[async_trait]
pub trait GlobalHash: Send + Sync {
    /// Current fingerprint, `None` when the outbound has none right now.
    async fn global_hash(&self) -> Option<String>;
}

struct FnGlobalHash<F>(F);

#[async_trait]
impl<F> GlobalHash for FnGlobalHash<F>
where
    F: Fn() -> Option<String> + Send + Sync,
{
    async fn global_hash(&self) -> Option<String> {
        (self.0)()
    }
}

/// Client reply to a cache probe.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheProbe {
    /// Outbound the probe answers.
    pub method: String,
    /// Global hash the client stored.
    #[serde(default)]
    pub global_hash: Option<String>,
    /// Specific hash the client stored.
    #[serde(default)]
    pub specific_hash: Option<String>,
}

/// What a delivery attempt sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// Whole collection.
    Full,
    /// `data_diff` frame.
    Diff,
    /// Cache probe; the data follows the client's reply.
    CacheProbe,
    /// `cache_restore`; the client's cache is current.
    CacheRestore,
    /// Nothing changed since the baseline; nothing sent.
    Unchanged,
    /// The connection may not see this feed; nothing sent.
    Unauthorized,
    /// The frame could not be queued.
    Dropped,
}

impl Delivery {
    /// Label used for metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Diff => "diff",
            Self::CacheProbe => "cache_probe",
            Self::CacheRestore => "cache_restore",
            Self::Unchanged => "unchanged",
            Self::Unauthorized => "unauthorized",
            Self::Dropped => "dropped",
        }
    }
}

/// Boot-time configuration of an outbound.
pub struct OutboundConfig {
    method: String,
    producer: Arc<dyn Producer>,
    lazy_loading: bool,
    supports_cache: bool,
    partial_updates: bool,
    resend_after_authentication_change: bool,
    update_all_subscribers: bool,
    authenticator: Option<Authenticator>,
    filters: Vec<Arc<dyn MessageFilter>>,
    global_hash: Option<Arc<dyn GlobalHash>>,
}

impl OutboundConfig {
    /// Feed `method` produced by `producer`.
    pub fn new(method: impl Into<String>, producer: Arc<dyn Producer>) -> Self {
        Self {
            method: method.into(),
            producer,
            lazy_loading: false,
            supports_cache: true,
            partial_updates: false,
            resend_after_authentication_change: false,
            update_all_subscribers: false,
            authenticator: None,
            filters: Vec::new(),
            global_hash: None,
        }
    }

    /// Deliver only after an explicit `request.<method>`.
    #[must_use]
    pub fn lazy_loading(mut self, enabled: bool) -> Self {
        self.lazy_loading = enabled;
        self
    }

    /// Take part in the cache-probe protocol (on by default).
    #[must_use]
    pub fn supports_cache(mut self, enabled: bool) -> Self {
        self.supports_cache = enabled;
        self
    }

    /// Send diffs against the previous delivery instead of full collections.
    #[must_use]
    pub fn partial_updates(mut self, enabled: bool) -> Self {
        self.partial_updates = enabled;
        self
    }

    /// Re-deliver when a route marked `modifies_authentication` succeeds.
    #[must_use]
    pub fn resend_after_authentication_change(mut self, enabled: bool) -> Self {
        self.resend_after_authentication_change = enabled;
        self
    }

    /// Refresh every subscriber on any update, ignoring the partition.
    #[must_use]
    pub fn update_all_subscribers(mut self, enabled: bool) -> Self {
        self.update_all_subscribers = enabled;
        self
    }

    /// Gate every delivery.
    #[must_use]
    pub fn authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Subscribe every recipient to the partition `filter` computes.
    #[must_use]
    pub fn subscribe(mut self, filter: Arc<dyn MessageFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Attach a global hash provider.
    #[must_use]
    pub fn global_hash(mut self, provider: impl GlobalHash + 'static) -> Self {
        self.global_hash = Some(Arc::new(provider));
        self
    }

    /// Attach a synchronous global hash provider.
    #[must_use]
    pub fn global_hash_fn<F>(self, provider: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.global_hash(FnGlobalHash(provider))
    }

    /// Method of the feed being configured.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Whether delivery waits for a `request.<method>` call.
    pub fn is_lazy(&self) -> bool {
        self.lazy_loading
    }

    pub(crate) fn freeze(self, cache_enabled: bool, snapshot_memory: usize) -> Outbound {
        Outbound {
            method: self.method,
            producer: self.producer,
            lazy_loading: self.lazy_loading,
            supports_cache: self.supports_cache,
            partial_updates: self.partial_updates,
            resend_after_authentication_change: self.resend_after_authentication_change,
            update_all_subscribers: self.update_all_subscribers,
            authenticator: self.authenticator,
            filters: self.filters,
            global_hash: self.global_hash,
            cache_enabled,
            subscriptions: Subscriptions::new(),
            snapshots: SnapshotMemory::new(snapshot_memory),
        }
    }
}

/// A registered data feed.
pub struct Outbound {
    method: String,
    producer: Arc<dyn Producer>,
    lazy_loading: bool,
    supports_cache: bool,
    partial_updates: bool,
    resend_after_authentication_change: bool,
    update_all_subscribers: bool,
    authenticator: Option<Authenticator>,
    filters: Vec<Arc<dyn MessageFilter>>,
    global_hash: Option<Arc<dyn GlobalHash>>,
    cache_enabled: bool,
    subscriptions: Subscriptions,
    snapshots: SnapshotMemory,
}

impl Outbound {
    /// Start configuring a feed.
    pub fn builder(method: impl Into<String>, producer: Arc<dyn Producer>) -> OutboundConfig {
        OutboundConfig::new(method, producer)
    }

    /// Feed method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Whether delivery waits for `request.<method>`.
    pub fn is_lazy(&self) -> bool {
        self.lazy_loading
    }

    /// Whether the cache-probe protocol applies to this feed.
    pub fn supports_cache(&self) -> bool {
        self.cache_enabled && self.supports_cache
    }

    /// Whether deliveries are diffs against the previous delivery.
    pub fn has_partial_updates(&self) -> bool {
        self.partial_updates
    }

    /// Whether auth changes trigger re-delivery.
    pub fn resends_after_authentication_change(&self) -> bool {
        self.resend_after_authentication_change
    }

    /// Subscriber index.
    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    /// Snapshot memory.
    pub fn snapshots(&self) -> &SnapshotMemory {
        &self.snapshots
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("method", &self.method)
            .field("lazy_loading", &self.lazy_loading)
            .field("supports_cache", &self.supports_cache)
            .field("partial_updates", &self.partial_updates)
            .field("partitions", &self.subscriptions.partition_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{FeedData, producer_fn};
    use serde_json::json;

    fn producer() -> Arc<dyn Producer> {
        producer_fn(|_, _, _| async { Ok(FeedData::Items(vec![])) })
    }

    #[test]
    fn config_defaults() {
        let outbound = OutboundConfig::new("todos", producer()).freeze(true, 4);
        assert_eq!(outbound.method(), "todos");
        assert!(!outbound.is_lazy());
        assert!(outbound.supports_cache());
        assert!(!outbound.has_partial_updates());
        assert!(!outbound.resends_after_authentication_change());
    }

    #[test]
    fn global_switch_disables_cache() {
        let outbound = Outbound::builder("todos", producer()).freeze(false, 4);
        assert!(!outbound.supports_cache());
    }

    #[test]
    fn builder_flags() {
        let outbound = Outbound::builder("feed", producer())
            .lazy_loading(true)
            .supports_cache(false)
            .partial_updates(true)
            .resend_after_authentication_change(true)
            .freeze(true, 4);
        assert!(outbound.is_lazy());
        assert!(!outbound.supports_cache());
        assert!(outbound.has_partial_updates());
        assert!(outbound.resends_after_authentication_change());
    }

    #[test]
    fn cache_probe_deserializes() {
        let probe: CacheProbe =
            serde_json::from_value(json!({"method": "todos", "specificHash": "abc"})).unwrap();
        assert_eq!(probe.method, "todos");
        assert_eq!(probe.specific_hash.as_deref(), Some("abc"));
        assert!(probe.global_hash.is_none());
    }

    #[test]
    fn delivery_labels() {
        assert_eq!(Delivery::CacheRestore.as_str(), "cache_restore");
        assert_eq!(Delivery::Full.as_str(), "full");
    }
}

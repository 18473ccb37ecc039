//! Per-client connection state.
//!
//! A [`Connection`] is shared by the transport, the router and every outbound
//! the client is subscribed to. It owns the sending half of the client's frame
//! queue plus the state the delivery engine keeps per client: cache support,
//! auth token, per-outbound baselines and lazy-load request configs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use feedwire_core::frame::{self, Frame};
use feedwire_core::ConnectionId;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What a client asked a lazy outbound for.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestConfig {
    /// Identity of a single item to fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Page size to fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

/// Browser metadata reported through `___browser`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserInfo {
    /// Browser name.
    pub name: Option<String>,
    /// Browser version.
    pub version: Option<String>,
    /// Raw user agent.
    pub user_agent: Option<String>,
}

/// A connected client.
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<Arc<String>>,
    connected_at: Instant,
    remote_addr: Option<SocketAddr>,
    supports_cache: AtomicBool,
    logging: AtomicBool,
    closed: AtomicBool,
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    auth_token: RwLock<Option<String>>,
    attributes: RwLock<HashMap<String, Value>>,
    baselines: Mutex<HashMap<String, Vec<Value>>>,
    request_configs: Mutex<HashMap<String, RequestConfig>>,
    browser: Mutex<Option<BrowserInfo>>,
    ip_reported: AtomicBool,
    dropped_frames: AtomicU64,
}

impl Connection {
    /// Create a connection around the sending half of its frame queue.
    pub fn new(
        tx: mpsc::Sender<Arc<String>>,
        remote_addr: Option<SocketAddr>,
        supports_cache: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::next(),
            tx,
            connected_at: now,
            remote_addr,
            supports_cache: AtomicBool::new(supports_cache),
            logging: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            auth_token: RwLock::new(None),
            attributes: RwLock::new(HashMap::new()),
            baselines: Mutex::new(HashMap::new()),
            request_configs: Mutex::new(HashMap::new()),
            browser: Mutex::new(None),
            ip_reported: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Process-unique id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer address, when the transport knows it.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Encode and queue a frame.
    ///
    /// Returns `false` if the connection is closed, the frame cannot be
    /// encoded, or the queue is full; a full or closed queue increments the
    /// dropped frame counter.
    pub fn send(&self, frame: &Frame) -> bool {
        if self.is_closed() {
            return false;
        }
        match frame::encode(frame) {
            Ok(text) => {
                if self.logging() {
                    debug!(conn_id = %self.id, method = %frame.method, "frame sent");
                }
                self.send_text(Arc::new(text))
            }
            Err(error) => {
                warn!(conn_id = %self.id, method = %frame.method, %error, "frame encode failed");
                false
            }
        }
    }

    /// Queue pre-encoded text.
    pub fn send_text(&self, text: Arc<String>) -> bool {
        if self.tx.try_send(text).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Whether the cache-probe protocol is active for this client.
    pub fn supports_cache(&self) -> bool {
        self.supports_cache.load(Ordering::Relaxed)
    }

    /// Toggle cache support.
    pub fn set_supports_cache(&self, enabled: bool) {
        self.supports_cache.store(enabled, Ordering::Relaxed);
    }

    /// Whether outgoing frames are logged at debug level.
    pub fn logging(&self) -> bool {
        self.logging.load(Ordering::Relaxed)
    }

    /// Toggle frame logging.
    pub fn set_logging(&self, enabled: bool) {
        self.logging.store(enabled, Ordering::Relaxed);
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Mark the connection closed. Returns `true` only for the first call.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Whether the transport has closed this connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the connection as alive (pong or any inbound traffic).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    // ── Auth and session attributes ─────────────────────────────────

    /// Current auth token.
    pub fn auth_token(&self) -> Option<String> {
        self.auth_token.read().clone()
    }

    /// Replace the auth token.
    pub fn set_auth_token(&self, token: Option<String>) {
        *self.auth_token.write() = token;
    }

    /// Whether an auth token is present.
    pub fn is_authenticated(&self) -> bool {
        self.auth_token.read().is_some()
    }

    /// Session attribute set by handlers.
    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes.read().get(key).cloned()
    }

    /// Store a session attribute.
    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        let _ = self.attributes.write().insert(key.into(), value);
    }

    /// Remove a session attribute.
    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.attributes.write().remove(key)
    }

    // ── Baselines ───────────────────────────────────────────────────

    /// Last collection delivered for `method`.
    pub fn baseline(&self, method: &str) -> Option<Vec<Value>> {
        self.baselines.lock().get(method).cloned()
    }

    /// Replace the baseline for `method`.
    pub fn set_baseline(&self, method: &str, items: Vec<Value>) {
        let _ = self.baselines.lock().insert(method.to_owned(), items);
    }

    /// Mutate the baseline for `method` in place, creating it if absent.
    pub fn update_baseline(&self, method: &str, update: impl FnOnce(&mut Vec<Value>)) {
        let mut baselines = self.baselines.lock();
        update(baselines.entry(method.to_owned()).or_default());
    }

    /// Drop the baseline for `method`.
    pub fn clear_baseline(&self, method: &str) -> bool {
        self.baselines.lock().remove(method).is_some()
    }

    // ── Lazy-load request configs ───────────────────────────────────

    /// Stored request config for `method` (default when never requested).
    pub fn request_config(&self, method: &str) -> RequestConfig {
        self.request_configs
            .lock()
            .get(method)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether the client has requested `method`.
    pub fn has_request_config(&self, method: &str) -> bool {
        self.request_configs.lock().contains_key(method)
    }

    /// Store the request config for `method`.
    pub fn set_request_config(&self, method: &str, config: RequestConfig) {
        let _ = self.request_configs.lock().insert(method.to_owned(), config);
    }

    // ── Client metadata ─────────────────────────────────────────────

    /// Store browser metadata. Returns `false` if already recorded.
    pub fn set_browser_once(&self, info: BrowserInfo) -> bool {
        let mut browser = self.browser.lock();
        if browser.is_some() {
            return false;
        }
        *browser = Some(info);
        true
    }

    /// Browser metadata, if reported.
    pub fn browser(&self) -> Option<BrowserInfo> {
        self.browser.lock().clone()
    }

    /// Claim the single IP report. Returns `true` only for the first call.
    pub fn take_ip_report(&self) -> bool {
        !self.ip_reported.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("supports_cache", &self.supports_cache())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_connection() -> (Connection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(32);
        (Connection::new(tx, None, true), rx)
    }

    #[test]
    fn ids_are_unique() {
        let (a, _ra) = make_connection();
        let (b, _rb) = make_connection();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn send_encodes_frame() {
        let (conn, mut rx) = make_connection();
        assert!(conn.send(&Frame::cache_restore("todos")));
        let text = rx.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, json!({"method": "todos", "value": "cache_restore"}));
    }

    #[test]
    fn send_to_full_channel_counts_drop() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(tx, None, false);
        assert!(conn.send(&Frame::new("a")));
        assert!(!conn.send(&Frame::new("b")));
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn send_after_close_is_refused() {
        let (conn, _rx) = make_connection();
        assert!(conn.mark_closed());
        assert!(!conn.mark_closed());
        assert!(!conn.send(&Frame::new("a")));
        assert_eq!(conn.drop_count(), 0);
    }

    #[test]
    fn send_without_method_fails() {
        let (conn, _rx) = make_connection();
        assert!(!conn.send(&Frame::default()));
    }

    #[test]
    fn auth_token_roundtrip() {
        let (conn, _rx) = make_connection();
        assert!(!conn.is_authenticated());
        conn.set_auth_token(Some("t".into()));
        assert!(conn.is_authenticated());
        assert_eq!(conn.auth_token().as_deref(), Some("t"));
        conn.set_auth_token(None);
        assert!(!conn.is_authenticated());
    }

    #[test]
    fn attributes() {
        let (conn, _rx) = make_connection();
        conn.set_attribute("room", json!(5));
        assert_eq!(conn.attribute("room"), Some(json!(5)));
        assert_eq!(conn.remove_attribute("room"), Some(json!(5)));
        assert!(conn.attribute("room").is_none());
    }

    #[test]
    fn baseline_lifecycle() {
        let (conn, _rx) = make_connection();
        assert!(conn.baseline("todos").is_none());
        conn.set_baseline("todos", vec![json!({"id": 1})]);
        conn.update_baseline("todos", |items| items.push(json!({"id": 2})));
        assert_eq!(conn.baseline("todos").unwrap().len(), 2);
        assert!(conn.clear_baseline("todos"));
        assert!(!conn.clear_baseline("todos"));
    }

    #[test]
    fn request_config_defaults() {
        let (conn, _rx) = make_connection();
        assert!(!conn.has_request_config("feed"));
        assert_eq!(conn.request_config("feed"), RequestConfig::default());
        conn.set_request_config(
            "feed",
            RequestConfig {
                id: None,
                count: Some(20),
            },
        );
        assert!(conn.has_request_config("feed"));
        assert_eq!(conn.request_config("feed").count, Some(20));
    }

    #[test]
    fn request_config_deserializes() {
        let config: RequestConfig = serde_json::from_value(json!({"count": 5})).unwrap();
        assert_eq!(config.count, Some(5));
        assert!(config.id.is_none());
        let config: RequestConfig = serde_json::from_value(json!({"id": "a"})).unwrap();
        assert_eq!(config.id, Some(json!("a")));
    }

    #[test]
    fn browser_and_ip_are_reported_once() {
        let (conn, _rx) = make_connection();
        assert!(conn.set_browser_once(BrowserInfo::default()));
        assert!(!conn.set_browser_once(BrowserInfo {
            name: Some("x".into()),
            ..BrowserInfo::default()
        }));
        assert_eq!(conn.browser(), Some(BrowserInfo::default()));
        assert!(conn.take_ip_report());
        assert!(!conn.take_ip_report());
    }

    #[test]
    fn heartbeat_flags() {
        let (conn, _rx) = make_connection();
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
        assert!(conn.last_pong_elapsed() < Duration::from_secs(5));
    }
}

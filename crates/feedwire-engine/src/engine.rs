//! Engine façade used by transports.

use std::net::SocketAddr;
use std::sync::Arc;

use feedwire_core::frame::{self, Frame};
use feedwire_settings::EngineSettings;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::connection::Connection;
use crate::errors::{EngineError, Result};
use crate::outbound::{Outbound, OutboundConfig, OutboundRegistry};
use crate::reserved;
use crate::route::Route;
use crate::router::{Outcome, Request, Router};

/// Router, outbounds and reserved routes behind one handle.
pub struct Engine {
    router: Router,
    outbounds: Arc<OutboundRegistry>,
    settings: EngineSettings,
}

impl Engine {
    /// Engine with only the reserved routes registered.
    pub fn new(settings: EngineSettings) -> Self {
        let outbounds = Arc::new(OutboundRegistry::new(settings.clone()));
        let engine = Self {
            router: Router::new(Arc::clone(&outbounds)),
            outbounds,
            settings,
        };
        engine.install_reserved_routes();
        engine
    }

    fn install_reserved_routes(&self) {
        let routes = [
            reserved::cache_route(Arc::clone(&self.outbounds)),
            reserved::browser_route(),
            reserved::ip_route(),
        ];
        for route in routes {
            if let Err(err) = self.router.register_standalone(route) {
                warn!(error = %err, "reserved route not installed");
            }
        }
    }

    /// Engine settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// The router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The outbound registry.
    pub fn outbounds(&self) -> &Arc<OutboundRegistry> {
        &self.outbounds
    }

    /// Register a root route.
    pub fn add_route(&self, route: Route) -> Result<()> {
        self.router.register(route)
    }

    /// Register a route matched by its whole path.
    pub fn add_standalone_route(&self, route: Route) -> Result<()> {
        self.router.register_standalone(route)
    }

    /// Register an outbound. Lazy outbounds also get their
    /// `request.<method>` route.
    pub fn add_outbound(&self, config: OutboundConfig) -> Result<Arc<Outbound>> {
        if config.is_lazy() {
            let lazy_path = reserved::request_path(config.method());
            if self.router.route_by_method(&lazy_path).is_ok() {
                return Err(EngineError::DuplicateRoute { method: lazy_path });
            }
        }

        let outbound = self.outbounds.add_outbound(config)?;
        if outbound.is_lazy() {
            self.router
                .register_standalone(reserved::lazy_route(Arc::clone(&outbound)))?;
        }
        Ok(outbound)
    }

    /// Route node serving `path`.
    pub fn route_by_method(&self, path: &str) -> Result<Arc<Route>> {
        self.router.route_by_method(path)
    }

    /// Outbound by method.
    pub fn outbound(&self, method: &str) -> Result<Arc<Outbound>> {
        self.outbounds.get(method)
    }

    /// Drop every route and outbound, keeping the reserved routes.
    pub fn clear(&self) {
        self.router.clear();
        self.outbounds.clear();
        self.install_reserved_routes();
    }

    /// Create the engine-side state of a new transport connection.
    ///
    /// Caching is active only if both the client asked for it and the engine
    /// allows it.
    pub fn connect(
        &self,
        tx: mpsc::Sender<Arc<String>>,
        remote_addr: Option<SocketAddr>,
        wants_cache: bool,
    ) -> Arc<Connection> {
        let connection = Connection::new(tx, remote_addr, wants_cache && self.settings.cache_enabled);
        connection.set_logging(self.settings.log_frames);
        Arc::new(connection)
    }

    /// Push every eager outbound to a newly opened connection.
    #[instrument(skip_all, fields(conn_id = %connection.id()))]
    pub async fn connection_opened(&self, connection: &Arc<Connection>) {
        info!(
            cache = connection.supports_cache(),
            remote = ?connection.remote_addr(),
            "connection opened"
        );
        self.outbounds.send_to_connection(connection).await;
    }

    /// Release a closed connection. Only the first call has an effect.
    pub fn connection_closed(&self, connection: &Connection) {
        if connection.mark_closed() {
            let removed = self.outbounds.unsubscribe_connection(connection);
            info!(
                conn_id = %connection.id(),
                subscriptions = removed,
                dropped_frames = connection.drop_count(),
                "connection closed"
            );
        }
    }

    /// Route one inbound frame. An unknown path is answered with an error
    /// frame and returned as [`EngineError::RouteNotFound`].
    pub async fn handle_frame(&self, connection: &Arc<Connection>, frame: Frame) -> Result<Outcome> {
        let message_id = frame.message_id;
        let request = Request::from_frame(frame, Arc::clone(connection));
        match self.router.route(request).await {
            Err(err @ EngineError::RouteNotFound { .. }) => {
                warn!(conn_id = %connection.id(), error = %err, "unroutable frame");
                let _ = connection.send(&Frame::error(err.to_string(), message_id));
                Err(err)
            }
            other => other,
        }
    }

    /// Decode inbound text, answering malformed text with an error frame.
    pub fn parse_frames(&self, connection: &Connection, text: &str) -> Result<Vec<Frame>> {
        frame::decode(text).map_err(|err| {
            debug!(conn_id = %connection.id(), error = %err, "malformed frame");
            let _ = connection.send(&Frame::error(err.to_string(), None));
            err.into()
        })
    }

    /// Decode inbound text and route each frame in order.
    pub async fn handle_text(&self, connection: &Arc<Connection>, text: &str) -> Result<Vec<Outcome>> {
        let frames = self.parse_frames(connection, text)?;
        let mut outcomes = Vec::with_capacity(frames.len());
        for frame in frames {
            if let Ok(outcome) = self.handle_frame(connection, frame).await {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("router", &self.router)
            .field("outbounds", &self.outbounds)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use feedwire_core::Sentinel;
    use feedwire_core::frame::{BROWSER_METHOD, CACHE_METHOD, ERROR_METHOD, IP_METHOD};
    use feedwire_core::hash::items_hash;
    use serde_json::{Value, json};

    use crate::auth::Authenticator;
    use crate::handler::Reply;
    use crate::test_helpers::{Store, drain, next_frame, settings};

    fn engine(cache: bool) -> Engine {
        Engine::new(settings(cache))
    }

    fn connect(engine: &Engine, wants_cache: bool) -> (Arc<Connection>, crate::test_helpers::Rx) {
        let (tx, rx) = mpsc::channel(64);
        (engine.connect(tx, None, wants_cache), rx)
    }

    fn todos() -> Vec<Value> {
        vec![json!({"id": 1, "title": "a"}), json!({"id": 2, "title": "b"})]
    }

    #[test]
    fn reserved_routes_are_installed() {
        let engine = engine(true);
        for path in [CACHE_METHOD, BROWSER_METHOD, IP_METHOD] {
            assert!(engine.route_by_method(path).is_ok(), "{path}");
        }
        engine.clear();
        assert!(engine.route_by_method(CACHE_METHOD).is_ok());
    }

    #[test]
    fn lazy_outbound_gets_request_route() {
        let engine = engine(true);
        let store = Store::new(vec![]);
        let _ = engine
            .add_outbound(OutboundConfig::new("feed", store.producer()).lazy_loading(true))
            .unwrap();
        let _ = engine
            .add_outbound(OutboundConfig::new("eager", store.producer()))
            .unwrap();
        assert!(engine.route_by_method("request.feed").is_ok());
        assert!(engine.route_by_method("request.eager").is_err());
    }

    #[test]
    fn duplicate_outbound_is_rejected() {
        let engine = engine(true);
        let store = Store::new(vec![]);
        let _ = engine.add_outbound(OutboundConfig::new("todos", store.producer())).unwrap();
        assert_matches!(
            engine.add_outbound(OutboundConfig::new("todos", store.producer())),
            Err(EngineError::DuplicateOutbound { .. })
        );
        assert_matches!(engine.outbound("nope"), Err(EngineError::OutboundNotFound { .. }));
    }

    #[test]
    fn connect_honours_cache_switch() {
        let (conn, _rx) = connect(&engine(false), true);
        assert!(!conn.supports_cache());
        let (conn, _rx) = connect(&engine(true), true);
        assert!(conn.supports_cache());
        let (conn, _rx) = connect(&engine(true), false);
        assert!(!conn.supports_cache());
    }

    #[tokio::test]
    async fn open_pushes_eager_outbounds_only() {
        let engine = engine(false);
        let store = Store::new(todos());
        let _ = engine.add_outbound(OutboundConfig::new("todos", store.producer())).unwrap();
        let _ = engine
            .add_outbound(OutboundConfig::new("lazy", store.producer()).lazy_loading(true))
            .unwrap();

        let (conn, mut rx) = connect(&engine, false);
        engine.connection_opened(&conn).await;
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].method, "todos");
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn failing_outbound_does_not_block_others() {
        let engine = engine(false);
        let store = Store::new(todos());
        let _ = engine
            .add_outbound(OutboundConfig::new(
                "broken",
                crate::handler::producer_fn(|_, _, _| async {
                    Err(feedwire_core::HandlerError::failed("down"))
                }),
            ))
            .unwrap();
        let _ = engine.add_outbound(OutboundConfig::new("todos", store.producer())).unwrap();

        let (conn, mut rx) = connect(&engine, false);
        engine.connection_opened(&conn).await;
        let methods: Vec<_> = drain(&mut rx).into_iter().map(|f| f.method).collect();
        assert_eq!(methods, ["todos"]);
    }

    #[tokio::test]
    async fn close_unsubscribes_everywhere_once() {
        let engine = engine(false);
        let store = Store::new(todos());
        let outbound = engine.add_outbound(OutboundConfig::new("todos", store.producer())).unwrap();
        let (conn, _rx) = connect(&engine, false);
        engine.connection_opened(&conn).await;
        assert!(outbound.subscriptions().contains(None, conn.id()));

        engine.connection_closed(&conn);
        engine.connection_closed(&conn);
        assert_eq!(outbound.subscriptions().membership_count(conn.id()), 0);
        assert_eq!(outbound.send_updated_data(None).await, 0);
    }

    #[tokio::test]
    async fn unknown_frame_gets_error_reply() {
        let engine = engine(false);
        let (conn, mut rx) = connect(&engine, false);
        let result = engine
            .handle_frame(&conn, Frame {
                message_id: Some(5),
                ..Frame::new("nope.nothing")
            })
            .await;
        assert_matches!(result, Err(EngineError::RouteNotFound { .. }));
        let frame = drain(&mut rx).remove(0);
        assert_eq!(frame.method, ERROR_METHOD);
        assert_eq!(frame.message_id, Some(5));
    }

    #[tokio::test]
    async fn malformed_text_gets_error_reply() {
        let engine = engine(false);
        let (conn, mut rx) = connect(&engine, false);
        assert_matches!(
            engine.handle_text(&conn, "{broken").await,
            Err(EngineError::Frame(_))
        );
        let frame = drain(&mut rx).remove(0);
        assert_eq!(frame.method, ERROR_METHOD);
        assert_eq!(frame.message_id, Some(-1));
    }

    #[tokio::test]
    async fn grouped_frames_are_routed_in_order() {
        let engine = engine(false);
        engine
            .add_route(Route::new("echo").handle_with(|payload, _| async move { Ok(Reply::Value(payload)) }))
            .unwrap();
        let (conn, mut rx) = connect(&engine, false);

        let text = frame::encode_group(&[
            Frame {
                value: Some(json!(1)),
                message_id: Some(1),
                ..Frame::new("echo")
            },
            Frame {
                value: Some(json!(2)),
                message_id: Some(2),
                ..Frame::new("echo")
            },
        ])
        .unwrap();
        let outcomes = engine.handle_text(&conn, &text).await.unwrap();
        assert_eq!(outcomes, [Outcome::Replied, Outcome::Replied]);
        let ids: Vec<_> = drain(&mut rx).into_iter().map(|f| f.message_id).collect();
        assert_eq!(ids, [Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn cache_round_trip_over_frames() {
        let engine = engine(true);
        let store = Store::new(todos());
        let _ = engine.add_outbound(OutboundConfig::new("todos", store.producer())).unwrap();

        // First visit: probe, empty reply, full diff.
        let (conn, mut rx) = connect(&engine, true);
        engine.connection_opened(&conn).await;
        let probe = next_frame(&mut rx).await;
        assert_eq!(probe.method, CACHE_METHOD);
        assert_eq!(probe.value, Some(json!("todos")));

        engine
            .handle_text(&conn, r#"{"method":"___cache","value":{"method":"todos"}}"#)
            .await
            .unwrap();
        let data = next_frame(&mut rx).await;
        let hash = data.specific_hash.clone().unwrap();
        assert_eq!(hash, items_hash(&todos()));
        engine.connection_closed(&conn);

        // Second visit with the stored hash: cache restore.
        let (conn, mut rx) = connect(&engine, true);
        engine.connection_opened(&conn).await;
        let _ = next_frame(&mut rx).await;
        let reply = json!({"method": "___cache", "value": {"method": "todos", "specificHash": hash}});
        engine.handle_text(&conn, &reply.to_string()).await.unwrap();
        assert_eq!(next_frame(&mut rx).await.sentinel(), Some(Sentinel::CacheRestore));
        engine.connection_closed(&conn);

        // Third visit after a change: diff with a new hash.
        store.push(json!({"id": 3, "title": "c"}));
        let (conn, mut rx) = connect(&engine, true);
        engine.connection_opened(&conn).await;
        let _ = next_frame(&mut rx).await;
        engine.handle_text(&conn, &reply.to_string()).await.unwrap();
        let diff = next_frame(&mut rx).await;
        assert_eq!(diff.sentinel(), Some(Sentinel::DataDiff));
        assert_ne!(diff.specific_hash.as_deref(), Some(hash.as_str()));
        assert_eq!(diff.inserted, Some(vec![json!({"id": 3, "title": "c"})]));
        assert_eq!(diff.updated, Some(vec![]));
        assert_eq!(diff.deleted, Some(vec![]));
    }

    #[tokio::test]
    async fn login_flow_resends_and_logout_revokes() {
        let engine = engine(false);
        let store = Store::new(todos());
        let outbound = engine
            .add_outbound(
                OutboundConfig::new("inbox", store.producer())
                    .authenticator(Authenticator::authenticated())
                    .resend_after_authentication_change(true),
            )
            .unwrap();
        engine
            .add_route(
                Route::new("auth")
                    .child(Route::new("login").modifies_authentication().handle_with(
                        |_, conn: Arc<Connection>| async move {
                            conn.set_auth_token(Some("tok".into()));
                            Ok(Reply::Empty)
                        },
                    ))
                    .child(Route::new("logout").modifies_authentication().handle_with(
                        |_, conn: Arc<Connection>| async move {
                            conn.set_auth_token(None);
                            Ok(Reply::Empty)
                        },
                    )),
            )
            .unwrap();

        let (conn, mut rx) = connect(&engine, false);
        engine.connection_opened(&conn).await;
        assert!(drain(&mut rx).is_empty());

        engine.handle_frame(&conn, Frame::new("auth.login")).await.unwrap();
        assert_eq!(next_frame(&mut rx).await.value, Some(Value::Array(todos())));
        assert!(outbound.subscriptions().contains(None, conn.id()));

        engine.handle_frame(&conn, Frame::new("auth.logout")).await.unwrap();
        assert_eq!(next_frame(&mut rx).await.sentinel(), Some(Sentinel::DataDelete));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!outbound.subscriptions().contains(None, conn.id()));
    }

    #[tokio::test]
    async fn unrequested_lazy_outbound_is_not_resent() {
        let engine = engine(false);
        let store = Store::new(todos());
        let _ = engine
            .add_outbound(
                OutboundConfig::new("feed", store.producer())
                    .lazy_loading(true)
                    .resend_after_authentication_change(true),
            )
            .unwrap();
        engine
            .add_route(Route::new("login").modifies_authentication().handle_with(|_, _| async {
                Ok(Reply::Empty)
            }))
            .unwrap();

        let (conn, mut rx) = connect(&engine, false);
        engine.handle_frame(&conn, Frame::new("login")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(store.calls(), 0);

        engine.handle_frame(&conn, Frame::new("request.feed")).await.unwrap();
        let _ = drain(&mut rx);
        engine.handle_frame(&conn, Frame::new("login")).await.unwrap();
        assert_eq!(next_frame(&mut rx).await.method, "feed");
    }
}

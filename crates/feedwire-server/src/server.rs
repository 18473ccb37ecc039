//! `FeedwireServer`: Axum HTTP + WebSocket server around an [`Engine`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use feedwire_engine::Engine;
use feedwire_settings::ServerSettings;
use feedwire_settings::loader::parse_bool;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::errors::{Result, ServerError};
use crate::health::{self, HealthResponse};
use crate::metrics::WS_CONNECTIONS_REJECTED_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::{ConnectionRegistry, Heartbeat, SessionContext, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The engine every socket is attached to.
    pub engine: Arc<Engine>,
    /// Live connections.
    pub connections: Arc<ConnectionRegistry>,
    /// Transport settings.
    pub settings: Arc<ServerSettings>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus handle, if metrics are exported.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// The feedwire server.
pub struct FeedwireServer {
    settings: Arc<ServerSettings>,
    engine: Arc<Engine>,
    connections: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl FeedwireServer {
    /// Server for `engine` with the given transport settings.
    pub fn new(settings: ServerSettings, engine: Arc<Engine>) -> Self {
        Self {
            settings: Arc::new(settings),
            engine,
            connections: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router.
    pub fn router(&self) -> Router {
        let state = AppState {
            engine: Arc::clone(&self.engine),
            connections: Arc::clone(&self.connections),
            settings: Arc::clone(&self.settings),
            shutdown: Arc::clone(&self.shutdown),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
    }

    /// Bind and serve in the background until shutdown.
    ///
    /// Returns the bound address (port `0` picks a free one) and the serve
    /// task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(err) = serve.await {
                error!(error = %err, "server terminated");
            }
        });

        info!(%local_addr, "feedwire server listening");
        Ok((local_addr, handle))
    }

    /// The engine.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Live connections.
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Transport settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    cache: Option<String>,
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let limit = state.settings.max_connections;
    if state.connections.len() >= limit {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(%remote_addr, limit, "connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let wants_cache = params.cache.as_deref().and_then(parse_bool).unwrap_or(false);
    ws.max_message_size(state.settings.max_message_size)
        .on_upgrade(move |socket| accept(socket, remote_addr, wants_cache, state))
}

async fn accept(socket: WebSocket, remote_addr: SocketAddr, wants_cache: bool, state: AppState) {
    let (tx, rx) = mpsc::channel(state.settings.send_buffer_size.max(1));
    let connection = state.engine.connect(tx, Some(remote_addr), wants_cache);
    let ctx = SessionContext {
        engine: state.engine,
        connections: state.connections,
        heartbeat: Heartbeat::from(state.settings.as_ref()),
        shutdown: state.shutdown.token(),
    };
    run_ws_session(socket, connection, rx, ctx).await;
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.connections.len(),
        state.engine.router().route_count(),
        state.engine.outbounds().len(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use feedwire_engine::handler::producer_fn;
    use feedwire_engine::{FeedData, OutboundConfig, Reply, Route};
    use feedwire_settings::EngineSettings;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn make_server() -> FeedwireServer {
        let settings = ServerSettings {
            port: 0,
            ..ServerSettings::default()
        };
        FeedwireServer::new(settings, Arc::new(Engine::new(EngineSettings::default())))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[tokio::test]
    async fn health_reports_counters() {
        let server = make_server();
        server
            .engine()
            .add_route(Route::new("ping").handle_with(|_, _| async { Ok(Reply::Empty) }))
            .unwrap();
        let _ = server
            .engine()
            .add_outbound(OutboundConfig::new(
                "todos",
                producer_fn(|_, _, _| async { Ok(FeedData::Items(Vec::new())) }),
            ))
            .unwrap();

        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["outbounds"], 1);
        // ping plus the three reserved routes
        assert_eq!(body["routes"], 4);
        assert!(body["uptimeSecs"].is_number());
    }

    #[tokio::test]
    async fn metrics_disabled_is_not_found() {
        let (status, _) = get_json(make_server().router(), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_enabled_renders() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let app = make_server().with_metrics(handle).router();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn plain_get_on_ws_is_rejected() {
        let app = make_server().router();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        assert!(app.oneshot(req).await.unwrap().status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (status, _) = get_json(make_server().router(), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_free_port_and_stops() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

//! WebSocket session lifecycle, from upgrade through disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use feedwire_engine::{Connection, Engine};
use feedwire_settings::ServerSettings;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::registry::ConnectionRegistry;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL, WS_FRAMES_RECEIVED_TOTAL,
};

/// Ping cadence and liveness window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    /// Interval between server Ping frames.
    pub ping_interval: Duration,
    /// Disconnect after this long without a Pong.
    pub pong_timeout: Duration,
}

impl From<&ServerSettings> for Heartbeat {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            ping_interval: Duration::from_secs(settings.ping_interval_secs.max(1)),
            pong_timeout: Duration::from_secs(settings.pong_timeout_secs.max(1)),
        }
    }
}

/// Everything a session needs besides its socket.
#[derive(Clone, Debug)]
pub struct SessionContext {
    /// The engine serving this socket.
    pub engine: Arc<Engine>,
    /// Live connections.
    pub connections: Arc<ConnectionRegistry>,
    /// Liveness checks.
    pub heartbeat: Heartbeat,
    /// Server-wide shutdown signal.
    pub shutdown: CancellationToken,
}

/// Run one client session.
///
/// 1. Registers the connection and starts the writer, which drains the
///    connection's queue and sends periodic Pings
/// 2. Delivers eager outbounds
/// 3. Dispatches each inbound frame on its own task
/// 4. Releases the connection in the engine exactly once on exit
#[instrument(skip_all, fields(conn_id = %connection.id()))]
pub async fn run_ws_session(
    ws: WebSocket,
    connection: Arc<Connection>,
    send_rx: mpsc::Receiver<Arc<String>>,
    ctx: SessionContext,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let started = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    ctx.connections.add(Arc::clone(&connection));

    let mut writer = tokio::spawn(forward_outbound(
        ws_tx,
        send_rx,
        Arc::clone(&connection),
        ctx.heartbeat,
        ctx.shutdown.clone(),
    ));

    let engine = Arc::clone(&ctx.engine);
    let opened = Arc::clone(&connection);
    let _ = tokio::spawn(async move { engine.connection_opened(&opened).await });

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                if !handle_inbound(&ctx.engine, &connection, msg) {
                    break;
                }
            }
            _ = &mut writer => break,
        }
    }

    ctx.engine.connection_closed(&connection);
    let _ = ctx.connections.remove(connection.id());
    writer.abort();

    info!(
        duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

/// Handle one inbound socket message. Any traffic counts as liveness.
/// Returns `false` when the peer closed the socket.
fn handle_inbound(engine: &Arc<Engine>, connection: &Arc<Connection>, msg: Message) -> bool {
    connection.mark_alive();
    match msg {
        Message::Text(text) => dispatch(engine, connection, text.as_str()),
        Message::Binary(data) => match std::str::from_utf8(&data) {
            Ok(text) => dispatch(engine, connection, text),
            Err(_) => debug!(len = data.len(), "dropping non-UTF-8 binary frame"),
        },
        Message::Ping(_) | Message::Pong(_) => {}
        Message::Close(_) => {
            debug!("client sent close frame");
            return false;
        }
    }
    true
}

fn dispatch(engine: &Arc<Engine>, connection: &Arc<Connection>, text: &str) {
    let Ok(frames) = engine.parse_frames(connection, text) else {
        return;
    };
    counter!(WS_FRAMES_RECEIVED_TOTAL).increment(frames.len() as u64);
    for frame in frames {
        let engine = Arc::clone(engine);
        let connection = Arc::clone(connection);
        let _ = tokio::spawn(async move {
            let _ = engine.handle_frame(&connection, frame).await;
        });
    }
}

/// Drain the connection queue into the socket. Returns when the socket
/// fails, the peer stops answering Pings, or the server shuts down.
async fn forward_outbound(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut send_rx: mpsc::Receiver<Arc<String>>,
    connection: Arc<Connection>,
    heartbeat: Heartbeat,
    shutdown: CancellationToken,
) {
    let mut ping = tokio::time::interval(heartbeat.ping_interval);
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            msg = send_rx.recv() => {
                let Some(text) = msg else { break };
                if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if !connection.check_alive() && connection.last_pong_elapsed() > heartbeat.pong_timeout {
                    warn!(timeout = ?heartbeat.pong_timeout, "client unresponsive, disconnecting");
                    break;
                }
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            () = shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

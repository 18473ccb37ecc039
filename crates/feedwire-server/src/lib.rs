//! # feedwire-server
//!
//! Axum WebSocket transport for the feedwire engine.
//!
//! - `GET /ws`: one engine connection per socket, `?cache=1` opts into the
//!   cache-probe protocol
//! - `GET /health`: liveness and counters
//! - `GET /metrics`: Prometheus text when a recorder handle is supplied
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use errors::{Result, ServerError};
pub use server::FeedwireServer;

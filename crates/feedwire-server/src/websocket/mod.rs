//! WebSocket transport: live connection registry and per-socket sessions.

pub mod registry;
pub mod session;

pub use registry::ConnectionRegistry;
pub use session::{Heartbeat, SessionContext, run_ws_session};

//! # feedwire-engine
//!
//! Real-time subscription, routing and differential-delivery engine.
//!
//! - [`router::Router`] walks a tree of [`route::Route`] nodes, gates on
//!   [`auth::Authenticator`], replies on `"m." + path` and re-broadcasts the
//!   outbounds a route declares it modifies
//! - [`outbound::OutboundRegistry`] owns named data feeds, their
//!   partitioned subscriber index and the cache-probe protocol
//! - [`outbound::diff`] computes identity-based inserted/updated/deleted sets
//! - [`engine::Engine`] wires both together with the reserved protocol routes
//!
//! The transport is external: it owns a [`connection::Connection`]'s frame
//! queue, calls [`engine::Engine::connection_opened`] /
//! [`engine::Engine::connection_closed`] and feeds inbound frames to
//! [`engine::Engine::handle_frame`].

#![deny(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod engine;
pub mod errors;
pub mod filter;
pub mod handler;
pub mod outbound;
pub mod reserved;
pub mod route;
pub mod router;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use auth::Authenticator;
pub use connection::{Connection, RequestConfig};
pub use engine::Engine;
pub use errors::{EngineError, Result};
pub use filter::{MessageFilter, PartitionKey};
pub use handler::{FeedData, PartialResult, Producer, Reply, RouteHandler};
pub use outbound::{Delivery, Outbound, OutboundConfig, OutboundRegistry};
pub use route::Route;
pub use router::{Outcome, Request, Router};

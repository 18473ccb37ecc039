//! # feedwire-core
//!
//! Shared vocabulary for the feedwire crates:
//!
//! - **Frames**: [`frame::Frame`] wire type, reserved methods and [`frame::Sentinel`] values
//! - **Codec**: [`frame::encode`] / [`frame::decode`] including `data_group` flattening
//! - **Hashing**: stable content hashes used by the cache-probe protocol
//! - **IDs**: process-scoped monotonic [`ids::ConnectionId`]
//! - **Errors**: [`errors::HandlerError`] and [`errors::FrameError`] via `thiserror`
//! - **Logging**: `tracing` subscriber bootstrap and log capture for tests

#![deny(unsafe_code)]

pub mod errors;
pub mod frame;
pub mod hash;
pub mod ids;
pub mod logging;

pub use errors::{FrameError, HandlerError};
pub use frame::{Frame, Sentinel};
pub use ids::ConnectionId;

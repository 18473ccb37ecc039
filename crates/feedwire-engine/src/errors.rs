//! Engine error type.

use feedwire_core::{FrameError, HandlerError};
use thiserror::Error;

/// Registration, lookup and delivery failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A root route, sibling route or standalone path is already taken.
    #[error("route '{method}' is already registered")]
    DuplicateRoute {
        /// Conflicting method or path.
        method: String,
    },

    /// An outbound with this method is already registered.
    #[error("outbound '{method}' is already registered")]
    DuplicateOutbound {
        /// Conflicting method.
        method: String,
    },

    /// A route method is empty or contains the path separator.
    #[error("invalid route method '{method}': {reason}")]
    InvalidRouteMethod {
        /// Offending method.
        method: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// No route serves this path.
    #[error("no route for '{path}'")]
    RouteNotFound {
        /// Requested path.
        path: String,
    },

    /// No outbound has this method.
    #[error("no outbound '{method}'")]
    OutboundNotFound {
        /// Requested method.
        method: String,
    },

    /// A diff was needed but an item has no usable `id`.
    #[error("outbound '{method}' produced an item without an id")]
    MissingIdentity {
        /// Outbound whose data lacked identities.
        method: String,
    },

    /// Handler or producer failure.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// Wire codec failure.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl EngineError {
    /// Collapse into the failure channel handlers report through.
    pub fn into_handler_error(self) -> HandlerError {
        match self {
            Self::Handler(err) => err,
            other => HandlerError::failed(other.to_string()),
        }
    }

    /// Whether the failure belongs in the server log.
    pub fn is_logged(&self) -> bool {
        match self {
            Self::Handler(err) => err.is_logged(),
            _ => true,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

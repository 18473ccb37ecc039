//! Error taxonomy shared by handlers, producers and the wire codec.
//!
//! [`HandlerError`] is the failure half of the tagged result every route
//! handler and outbound producer returns. Its variants decide whether a
//! failure is logged and whether the client hears about it:
//!
//! | variant | logged | error frame |
//! |---|---|---|
//! | `Unauthorized` | never | only for explicit client requests |
//! | `Silent` | no | yes |
//! | `Failed` | yes | yes |

use thiserror::Error;

/// Failure raised by a route handler or an outbound producer.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Expected authentication rejection.
    #[error("unauthorized")]
    Unauthorized,

    /// Failure the author opted out of logging. Still sent to the client.
    #[error("{message}")]
    Silent {
        /// Message surfaced to the client.
        message: String,
    },

    /// Generic fault. Logged and sent to the client.
    #[error("{message}")]
    Failed {
        /// Message surfaced to the client.
        message: String,
    },
}

impl HandlerError {
    /// Build a generic, logged fault.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Build a fault that is surfaced to the client but not logged.
    pub fn silent(message: impl Into<String>) -> Self {
        Self::Silent {
            message: message.into(),
        }
    }

    /// Whether this failure belongs in the server log.
    pub fn is_logged(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Silent { .. } => "silent",
            Self::Failed { .. } => "failed",
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::failed(format!("invalid payload: {err}"))
    }
}

/// Errors produced while encoding or decoding wire frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The text is not a valid frame object.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame's `method` field is empty.
    #[error("frame has no method")]
    MissingMethod,

    /// A `data_group` frame contained another group.
    #[error("nested data_group frames are not supported")]
    NestedGroup,

    /// A `data_group` frame carried no frames.
    #[error("data_group frame carries no frames")]
    EmptyGroup,
}

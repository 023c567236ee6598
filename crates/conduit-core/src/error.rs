//! Error taxonomy shared by every Conduit crate.
//!
//! Kinds, not concrete types: callers match on the variant to decide
//! routing (the gateway maps them to HTTP status codes, the connection
//! layer decides what is worth logging). Invariant violations are not
//! represented here — those panic.

use crate::ids::{ChunkId, PeerId};
use crate::wire::WireError;

pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed frame, invalid control code, oversized chunk, version
    /// mismatch.
    #[error("protocol failure: {0}")]
    Protocol(String),

    /// Connect refused, TLS handshake failure, EOF mid-frame, short read,
    /// forced shutdown.
    #[error("connectivity failure: {0}")]
    Connectivity(String),

    /// Dispatch requested for a peer id with no live queue. User-expected.
    #[error("target peer {0} is not available")]
    TargetPeerNotFound(PeerId),

    /// Deadline exceeded; carries any response headers already received.
    #[error("operation timed out")]
    Timeout { headers: Vec<(String, String)> },

    /// Cache miss and upstream refused, or expected-security-id mismatch.
    #[error("authorization failure: {0}")]
    Authorization(String),

    /// Load or remove of an absent chunk id.
    #[error("chunk {0} does not exist")]
    ChunkNotFound(ChunkId),

    /// The operation was canceled through the control token.
    #[error("operation canceled")]
    Canceled,

    /// Catch-all for unexpected upstream conditions; preserves the cause.
    #[error("server failure: {message}")]
    Server {
        message: String,
        #[source]
        source: Option<Cause>,
    },
}

impl Error {
    pub fn server(message: impl Into<String>, source: impl Into<Cause>) -> Self {
        Error::Server {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn server_msg(message: impl Into<String>) -> Self {
        Error::Server {
            message: message.into(),
            source: None,
        }
    }

    pub fn timeout() -> Self {
        Error::Timeout {
            headers: Vec::new(),
        }
    }

    /// Errors that are part of normal operation (a dispatch target going
    /// away, cancellation during shutdown). Logged at trace and never
    /// surfaced as task failures.
    pub fn is_expected(&self) -> bool {
        matches!(self, Error::TargetPeerNotFound(_) | Error::Canceled)
    }

    /// Wrap a lower-level error when it crosses a backend boundary,
    /// preserving the original as a nested cause. Expected errors and
    /// errors that already carry a kind pass through untouched.
    pub fn into_server_error(self, message_prefix: &str) -> Self {
        match self {
            Error::Server { message, source } => Error::Server {
                message: format!("{message_prefix}: {message}"),
                source,
            },
            err if err.is_expected() => err,
            err @ (Error::Timeout { .. }
            | Error::Authorization(_)
            | Error::ChunkNotFound(_)) => err,
            err => Error::Server {
                message: format!("{message_prefix}: {err}"),
                source: Some(Box::new(err)),
            },
        }
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Connectivity(err.to_string())
    }
}

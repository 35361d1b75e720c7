//! RPC error taxonomy.
//!
//! Every call into the runtime resolves to a decoded result or one of
//! these variants — never a deadlock, never a panic. See spec §7 for the
//! propagation policy each variant follows.

use thiserror::Error;

/// Sub-kind of a [`RpcError::Transport`] failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The peer did not accept the session within the configured bound.
    Timeout,
    /// The peer actively rejected the session.
    Rejected,
    /// An I/O-level error occurred (socket error, unreachable host, ...).
    NetworkError,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Rejected => "rejected",
            TransportErrorKind::NetworkError => "network error",
        };
        f.write_str(s)
    }
}

/// Taxonomy of errors surfaced to RPC callers (spec §7).
#[derive(Debug, Error, Clone)]
pub enum RpcError {
    /// A session never opened, or was torn down at the transport layer.
    #[error("transport error: {kind}: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// Handshake/manifest mismatch, unsupported version, or malformed frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No server satisfies the routing strategy's criteria.
    #[error("no server available for this call")]
    Routing,

    /// The peer does not host the requested grain.
    #[error("grain unknown")]
    GrainUnknown,

    /// The peer's manifest has no such method on the interface.
    #[error("method unknown")]
    MethodUnknown,

    /// The call's deadline expired before a response arrived.
    #[error("call timed out")]
    Timeout,

    /// The caller canceled the call before it completed.
    #[error("call canceled")]
    Canceled,

    /// The connection was lost while the call was in flight.
    #[error("disconnected")]
    Disconnected,

    /// The peer returned `Response{status=Error}` with a message.
    #[error("peer error: {message}")]
    Peer { message: String },

    /// The server's admission control refused the request.
    #[error("server overloaded")]
    Overloaded,

    /// Payload exceeded the configured soft cap.
    #[error("payload too large: {size} bytes (cap {cap})")]
    PayloadTooLarge { size: usize, cap: usize },
}

impl RpcError {
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        RpcError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Whether this error is call-local (does not imply the connection died).
    ///
    /// Per spec §7: Timeout, Canceled, Peer, Lookup, Overloaded do not affect
    /// other in-flight calls on the same connection.
    pub fn is_call_local(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout
                | RpcError::Canceled
                | RpcError::Peer { .. }
                | RpcError::GrainUnknown
                | RpcError::MethodUnknown
                | RpcError::Overloaded
                | RpcError::PayloadTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

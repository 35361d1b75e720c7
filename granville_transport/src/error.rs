//! Transport-level error type, convertible into the runtime's [`RpcError`].

use granville_shared::errors::{RpcError, TransportErrorKind};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
#[error("transport error: {kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        RpcError::transport(e.kind, e.message)
    }
}

//! Serialization session boundary (spec §4.3).
//!
//! The payload codec itself is supplied by the embedder; this module only
//! enforces the two properties this runtime requires regardless of codec:
//! a fresh session per message (no cross-message back-references) and a
//! uniform buffer strategy (pooled growable writer on send, read-only view
//! on receive), plus the soft payload cap.

use bytes::{Bytes, BytesMut};

use crate::errors::RpcError;

/// A per-call encode session. Each call to [`EncodeSession::new`] starts
/// from an empty buffer — never reused across messages — which is the
/// mandatory isolation property from spec §4.3, independent of whether the
/// embedder's codec itself supports session reuse.
pub struct EncodeSession {
    buf: BytesMut,
    cap: usize,
}

impl EncodeSession {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            cap,
        }
    }

    /// Writable handle for the embedder's codec to serialize into.
    pub fn writer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Finalizes the session, enforcing the soft payload cap.
    pub fn finish(self) -> Result<Bytes, RpcError> {
        if self.buf.len() > self.cap {
            return Err(RpcError::PayloadTooLarge {
                size: self.buf.len(),
                cap: self.cap,
            });
        }
        Ok(self.buf.freeze())
    }
}

/// A per-message decode session: a read-only view over received bytes.
/// Constructed fresh per message for the same reason [`EncodeSession`] is.
pub struct DecodeSession {
    bytes: Bytes,
    cap: usize,
}

impl DecodeSession {
    pub fn new(bytes: Bytes, cap: usize) -> Result<Self, RpcError> {
        if bytes.len() > cap {
            return Err(RpcError::PayloadTooLarge {
                size: bytes.len(),
                cap,
            });
        }
        Ok(Self { bytes, cap })
    }

    pub fn view(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

/// Encodes an opaque payload with a host-supplied closure, as if through the
/// embedder's codec, and applies the soft cap. Most call sites go through
/// this convenience wrapper rather than driving [`EncodeSession`] directly.
pub fn encode_with<F>(cap: usize, write: F) -> Result<Bytes, RpcError>
where
    F: FnOnce(&mut BytesMut),
{
    let mut session = EncodeSession::new(cap);
    write(session.writer());
    session.finish()
}

/// Decodes an opaque payload with a host-supplied closure, enforcing the cap
/// before the closure ever sees the bytes.
pub fn decode_with<T, F>(bytes: Bytes, cap: usize, read: F) -> Result<T, RpcError>
where
    F: FnOnce(&[u8]) -> Result<T, RpcError>,
{
    let session = DecodeSession::new(bytes, cap)?;
    read(session.view())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_at_cap_is_accepted() {
        let cap = 16;
        let encoded = encode_with(cap, |w| w.extend_from_slice(&[0u8; 16])).unwrap();
        assert_eq!(encoded.len(), 16);
    }

    #[test]
    fn payload_one_byte_over_cap_is_rejected() {
        let cap = 16;
        let err = encode_with(cap, |w| w.extend_from_slice(&[0u8; 17])).unwrap_err();
        assert!(matches!(err, RpcError::PayloadTooLarge { size: 17, cap: 16 }));
    }

    #[test]
    fn decode_session_rejects_oversized_input_before_reading() {
        let bytes = Bytes::from(vec![0u8; 17]);
        let err = decode_with::<(), _>(bytes, 16, |_| Ok(())).unwrap_err();
        assert!(matches!(err, RpcError::PayloadTooLarge { .. }));
    }

    #[test]
    fn each_session_starts_from_an_empty_buffer() {
        let a = encode_with(1024, |w| w.extend_from_slice(b"first")).unwrap();
        let b = encode_with(1024, |w| w.extend_from_slice(b"second")).unwrap();
        assert_eq!(&a[..], b"first");
        assert_eq!(&b[..], b"second");
    }
}

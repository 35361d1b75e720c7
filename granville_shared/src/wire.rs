//! Wire protocol & codec (spec §4.2).
//!
//! Frames share a fixed 3-byte marker, a 1-byte tag, then tag-specific
//! fields. Integers are little-endian; variable-length fields are
//! length-prefixed. Unknown tags are tolerated (forward-compatible
//! extension point); unknown marker bytes are a hard parse failure.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::errors::RpcError;
use crate::model::{GrainId, GrainKey};

/// Protocol version this build of the wire codec speaks. Frozen per release;
/// bumping it is a breaking wire change (spec §4.2 "Versioning").
pub const PROTOCOL_VERSION: u16 = 1;

/// Fixed marker bytes ("GRV") leading every frame. Implementation-defined
/// per spec §4.2 / §9, but constant within a protocol version.
pub const FRAME_MARKER: [u8; 3] = [0x47, 0x52, 0x56];

bitflags! {
    /// Handshake capability bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const NONE = 0;
        /// Peer supports streaming responses (§4.6).
        const STREAMING = 1 << 0;
    }
}

bitflags! {
    /// Per-Request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u8 {
        const NONE = 0;
    }
}

bitflags! {
    /// Per-Response flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResponseFlags: u8 {
        const NONE = 0;
        /// Final frame of a streaming response (§4.6).
        const END_OF_STREAM = 1 << 0;
    }
}

/// Handshake role (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server = 0,
    Client = 1,
}

impl Role {
    fn from_byte(b: u8) -> Result<Self, RpcError> {
        match b {
            0 => Ok(Role::Server),
            1 => Ok(Role::Client),
            other => Err(RpcError::Protocol(format!("unknown role byte {other}"))),
        }
    }
}

/// Response status (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    Error = 1,
    Canceled = 2,
    MethodUnknown = 3,
    GrainUnknown = 4,
    /// Admission control refusal (§4.5 "Backpressure"). Carried as a status
    /// rather than folded into `Error` so clients can match on it directly.
    Overloaded = 5,
}

impl Status {
    fn from_byte(b: u8) -> Result<Self, RpcError> {
        match b {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Error),
            2 => Ok(Status::Canceled),
            3 => Ok(Status::MethodUnknown),
            4 => Ok(Status::GrainUnknown),
            5 => Ok(Status::Overloaded),
            other => Err(RpcError::Protocol(format!("unknown status byte {other}"))),
        }
    }
}

/// Close reason (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal = 0,
    VersionMismatch = 1,
    ProtocolError = 2,
    Shutdown = 3,
}

impl CloseReason {
    fn from_byte(b: u8) -> Result<Self, RpcError> {
        match b {
            0 => Ok(CloseReason::Normal),
            1 => Ok(CloseReason::VersionMismatch),
            2 => Ok(CloseReason::ProtocolError),
            3 => Ok(CloseReason::Shutdown),
            other => Err(RpcError::Protocol(format!("unknown close reason {other}"))),
        }
    }
}

/// A decoded manifest catalog payload (serialized inside `Manifest` frames).
/// Kept as its own serde type so the wire layout of the *outer* frame stays
/// hand-rolled while the (large, rarely-sent) catalog body can use serde_json.
pub type ManifestPayload = crate::model::Manifest;

/// One wire frame (spec §4.2).
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Handshake {
        protocol_version: u16,
        peer_id: Uuid,
        role: Role,
        capabilities: Capabilities,
    },
    HandshakeAck {
        protocol_version: u16,
        peer_id: Uuid,
        manifest_version: u32,
    },
    Manifest {
        manifest_version: u32,
        payload: ManifestPayload,
    },
    ManifestAck {
        manifest_version: u32,
    },
    Request {
        correlation_id: u64,
        grain_id: GrainId,
        interface_id: u32,
        method_index: u16,
        delivery_mode: u8,
        flags: RequestFlags,
        deadline_ms: u32,
        arguments: Bytes,
    },
    Response {
        correlation_id: u64,
        status: Status,
        flags: ResponseFlags,
        payload: Bytes,
    },
    OneWay {
        grain_id: GrainId,
        interface_id: u32,
        method_index: u16,
        delivery_mode: u8,
        flags: RequestFlags,
        deadline_ms: u32,
        arguments: Bytes,
    },
    Heartbeat {
        send_time_ms: u64,
    },
    HeartbeatAck {
        send_time_ms: u64,
    },
    Close {
        reason: CloseReason,
        message: String,
    },
    /// An unrecognized tag, preserved for forward compatibility (§4.2:
    /// "Unknown frame tags MUST be ignored").
    Unknown {
        tag: u8,
    },
}

mod tag {
    pub const HANDSHAKE: u8 = 0x01;
    pub const HANDSHAKE_ACK: u8 = 0x02;
    pub const MANIFEST: u8 = 0x03;
    pub const MANIFEST_ACK: u8 = 0x04;
    pub const REQUEST: u8 = 0x05;
    pub const RESPONSE: u8 = 0x06;
    pub const ONE_WAY: u8 = 0x07;
    pub const HEARTBEAT: u8 = 0x08;
    pub const HEARTBEAT_ACK: u8 = 0x09;
    pub const CLOSE: u8 = 0x0A;
}

fn put_bytes_lenprefixed(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn get_bytes_lenprefixed(buf: &mut Bytes) -> Result<Bytes, RpcError> {
    if buf.remaining() < 4 {
        return Err(RpcError::Protocol("truncated length prefix".into()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(RpcError::Protocol("truncated length-prefixed field".into()));
    }
    Ok(buf.copy_to_bytes(len))
}

fn put_grain_key(buf: &mut BytesMut, key: &GrainKey) {
    match key {
        GrainKey::String(s) => {
            buf.put_u8(0);
            put_bytes_lenprefixed(buf, s.as_bytes());
        }
        GrainKey::Integer(i) => {
            buf.put_u8(1);
            buf.put_i64_le(*i);
        }
        GrainKey::Guid(g) => {
            buf.put_u8(2);
            buf.put_slice(g.as_bytes());
        }
        GrainKey::Compound(parts) => {
            buf.put_u8(3);
            buf.put_u16_le(parts.len() as u16);
            for p in parts {
                put_grain_key(buf, p);
            }
        }
    }
}

fn get_grain_key(buf: &mut Bytes) -> Result<GrainKey, RpcError> {
    if buf.remaining() < 1 {
        return Err(RpcError::Protocol("truncated grain key tag".into()));
    }
    match buf.get_u8() {
        0 => {
            let raw = get_bytes_lenprefixed(buf)?;
            let s = String::from_utf8(raw.to_vec())
                .map_err(|e| RpcError::Protocol(format!("grain key utf8: {e}")))?;
            Ok(GrainKey::String(s))
        }
        1 => {
            if buf.remaining() < 8 {
                return Err(RpcError::Protocol("truncated grain key int".into()));
            }
            Ok(GrainKey::Integer(buf.get_i64_le()))
        }
        2 => {
            if buf.remaining() < 16 {
                return Err(RpcError::Protocol("truncated grain key guid".into()));
            }
            let mut raw = [0u8; 16];
            buf.copy_to_slice(&mut raw);
            Ok(GrainKey::Guid(Uuid::from_bytes(raw)))
        }
        3 => {
            if buf.remaining() < 2 {
                return Err(RpcError::Protocol("truncated grain key compound len".into()));
            }
            let count = buf.get_u16_le();
            let mut parts = Vec::with_capacity(count as usize);
            for _ in 0..count {
                parts.push(get_grain_key(buf)?);
            }
            Ok(GrainKey::Compound(parts))
        }
        other => Err(RpcError::Protocol(format!("unknown grain key tag {other}"))),
    }
}

fn put_grain_id(buf: &mut BytesMut, id: &GrainId) {
    buf.put_u32_le(id.interface_type_id);
    put_grain_key(buf, &id.key);
}

fn get_grain_id(buf: &mut Bytes) -> Result<GrainId, RpcError> {
    if buf.remaining() < 4 {
        return Err(RpcError::Protocol("truncated grain id".into()));
    }
    let interface_type_id = buf.get_u32_le();
    let key = get_grain_key(buf)?;
    Ok(GrainId {
        interface_type_id,
        key,
    })
}

fn put_request_body(
    buf: &mut BytesMut,
    grain_id: &GrainId,
    interface_id: u32,
    method_index: u16,
    delivery_mode: u8,
    flags: RequestFlags,
    deadline_ms: u32,
    arguments: &[u8],
) {
    put_grain_id(buf, grain_id);
    buf.put_u32_le(interface_id);
    buf.put_u16_le(method_index);
    buf.put_u8(delivery_mode);
    buf.put_u8(flags.bits());
    buf.put_u32_le(deadline_ms);
    put_bytes_lenprefixed(buf, arguments);
}

struct RequestBody {
    grain_id: GrainId,
    interface_id: u32,
    method_index: u16,
    delivery_mode: u8,
    flags: RequestFlags,
    deadline_ms: u32,
    arguments: Bytes,
}

fn get_request_body(buf: &mut Bytes) -> Result<RequestBody, RpcError> {
    let grain_id = get_grain_id(buf)?;
    if buf.remaining() < 4 + 2 + 1 + 1 + 4 {
        return Err(RpcError::Protocol("truncated request header".into()));
    }
    let interface_id = buf.get_u32_le();
    let method_index = buf.get_u16_le();
    let delivery_mode = buf.get_u8();
    let flags = RequestFlags::from_bits_truncate(buf.get_u8());
    let deadline_ms = buf.get_u32_le();
    let arguments = get_bytes_lenprefixed(buf)?;
    Ok(RequestBody {
        grain_id,
        interface_id,
        method_index,
        delivery_mode,
        flags,
        deadline_ms,
        arguments,
    })
}

impl Frame {
    pub fn encode(&self) -> Result<Bytes, RpcError> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(&FRAME_MARKER);
        match self {
            Frame::Handshake {
                protocol_version,
                peer_id,
                role,
                capabilities,
            } => {
                buf.put_u8(tag::HANDSHAKE);
                buf.put_u16_le(*protocol_version);
                buf.put_slice(peer_id.as_bytes());
                buf.put_u8(*role as u8);
                buf.put_u32_le(capabilities.bits());
            }
            Frame::HandshakeAck {
                protocol_version,
                peer_id,
                manifest_version,
            } => {
                buf.put_u8(tag::HANDSHAKE_ACK);
                buf.put_u16_le(*protocol_version);
                buf.put_slice(peer_id.as_bytes());
                buf.put_u32_le(*manifest_version);
            }
            Frame::Manifest {
                manifest_version,
                payload,
            } => {
                buf.put_u8(tag::MANIFEST);
                buf.put_u32_le(*manifest_version);
                let encoded = serde_json::to_vec(payload)
                    .map_err(|e| RpcError::Protocol(format!("encode manifest: {e}")))?;
                put_bytes_lenprefixed(&mut buf, &encoded);
            }
            Frame::ManifestAck { manifest_version } => {
                buf.put_u8(tag::MANIFEST_ACK);
                buf.put_u32_le(*manifest_version);
            }
            Frame::Request {
                correlation_id,
                grain_id,
                interface_id,
                method_index,
                delivery_mode,
                flags,
                deadline_ms,
                arguments,
            } => {
                buf.put_u8(tag::REQUEST);
                buf.put_u64_le(*correlation_id);
                put_request_body(
                    &mut buf,
                    grain_id,
                    *interface_id,
                    *method_index,
                    *delivery_mode,
                    *flags,
                    *deadline_ms,
                    arguments,
                );
            }
            Frame::Response {
                correlation_id,
                status,
                flags,
                payload,
            } => {
                buf.put_u8(tag::RESPONSE);
                buf.put_u64_le(*correlation_id);
                buf.put_u8(*status as u8);
                buf.put_u8(flags.bits());
                put_bytes_lenprefixed(&mut buf, payload);
            }
            Frame::OneWay {
                grain_id,
                interface_id,
                method_index,
                delivery_mode,
                flags,
                deadline_ms,
                arguments,
            } => {
                buf.put_u8(tag::ONE_WAY);
                buf.put_u64_le(0);
                put_request_body(
                    &mut buf,
                    grain_id,
                    *interface_id,
                    *method_index,
                    *delivery_mode,
                    *flags,
                    *deadline_ms,
                    arguments,
                );
            }
            Frame::Heartbeat { send_time_ms } => {
                buf.put_u8(tag::HEARTBEAT);
                buf.put_u64_le(*send_time_ms);
            }
            Frame::HeartbeatAck { send_time_ms } => {
                buf.put_u8(tag::HEARTBEAT_ACK);
                buf.put_u64_le(*send_time_ms);
            }
            Frame::Close { reason, message } => {
                buf.put_u8(tag::CLOSE);
                buf.put_u8(*reason as u8);
                put_bytes_lenprefixed(&mut buf, message.as_bytes());
            }
            Frame::Unknown { tag } => {
                buf.put_u8(*tag);
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RpcError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        if buf.remaining() < 4 {
            return Err(RpcError::Protocol("frame shorter than header".into()));
        }
        let mut marker = [0u8; 3];
        buf.copy_to_slice(&mut marker);
        if marker != FRAME_MARKER {
            return Err(RpcError::Protocol("bad frame marker".into()));
        }
        let t = buf.get_u8();
        match t {
            tag::HANDSHAKE => {
                if buf.remaining() < 2 + 16 + 1 + 4 {
                    return Err(RpcError::Protocol("truncated handshake".into()));
                }
                let protocol_version = buf.get_u16_le();
                let mut peer_bytes = [0u8; 16];
                buf.copy_to_slice(&mut peer_bytes);
                let role = Role::from_byte(buf.get_u8())?;
                let capabilities = Capabilities::from_bits_truncate(buf.get_u32_le());
                Ok(Frame::Handshake {
                    protocol_version,
                    peer_id: Uuid::from_bytes(peer_bytes),
                    role,
                    capabilities,
                })
            }
            tag::HANDSHAKE_ACK => {
                if buf.remaining() < 2 + 16 + 4 {
                    return Err(RpcError::Protocol("truncated handshake ack".into()));
                }
                let protocol_version = buf.get_u16_le();
                let mut peer_bytes = [0u8; 16];
                buf.copy_to_slice(&mut peer_bytes);
                let manifest_version = buf.get_u32_le();
                Ok(Frame::HandshakeAck {
                    protocol_version,
                    peer_id: Uuid::from_bytes(peer_bytes),
                    manifest_version,
                })
            }
            tag::MANIFEST => {
                if buf.remaining() < 4 {
                    return Err(RpcError::Protocol("truncated manifest".into()));
                }
                let manifest_version = buf.get_u32_le();
                let raw = get_bytes_lenprefixed(&mut buf)?;
                let payload: ManifestPayload = serde_json::from_slice(&raw)
                    .map_err(|e| RpcError::Protocol(format!("decode manifest: {e}")))?;
                Ok(Frame::Manifest {
                    manifest_version,
                    payload,
                })
            }
            tag::MANIFEST_ACK => {
                if buf.remaining() < 4 {
                    return Err(RpcError::Protocol("truncated manifest ack".into()));
                }
                Ok(Frame::ManifestAck {
                    manifest_version: buf.get_u32_le(),
                })
            }
            tag::REQUEST => {
                if buf.remaining() < 8 {
                    return Err(RpcError::Protocol("truncated request".into()));
                }
                let correlation_id = buf.get_u64_le();
                let body = get_request_body(&mut buf)?;
                Ok(Frame::Request {
                    correlation_id,
                    grain_id: body.grain_id,
                    interface_id: body.interface_id,
                    method_index: body.method_index,
                    delivery_mode: body.delivery_mode,
                    flags: body.flags,
                    deadline_ms: body.deadline_ms,
                    arguments: body.arguments,
                })
            }
            tag::RESPONSE => {
                if buf.remaining() < 8 + 1 + 1 {
                    return Err(RpcError::Protocol("truncated response".into()));
                }
                let correlation_id = buf.get_u64_le();
                let status = Status::from_byte(buf.get_u8())?;
                let flags = ResponseFlags::from_bits_truncate(buf.get_u8());
                let payload = get_bytes_lenprefixed(&mut buf)?;
                Ok(Frame::Response {
                    correlation_id,
                    status,
                    flags,
                    payload,
                })
            }
            tag::ONE_WAY => {
                if buf.remaining() < 8 {
                    return Err(RpcError::Protocol("truncated oneway".into()));
                }
                let _correlation_id_should_be_zero = buf.get_u64_le();
                let body = get_request_body(&mut buf)?;
                Ok(Frame::OneWay {
                    grain_id: body.grain_id,
                    interface_id: body.interface_id,
                    method_index: body.method_index,
                    delivery_mode: body.delivery_mode,
                    flags: body.flags,
                    deadline_ms: body.deadline_ms,
                    arguments: body.arguments,
                })
            }
            tag::HEARTBEAT => {
                if buf.remaining() < 8 {
                    return Err(RpcError::Protocol("truncated heartbeat".into()));
                }
                Ok(Frame::Heartbeat {
                    send_time_ms: buf.get_u64_le(),
                })
            }
            tag::HEARTBEAT_ACK => {
                if buf.remaining() < 8 {
                    return Err(RpcError::Protocol("truncated heartbeat ack".into()));
                }
                Ok(Frame::HeartbeatAck {
                    send_time_ms: buf.get_u64_le(),
                })
            }
            tag::CLOSE => {
                if buf.remaining() < 1 {
                    return Err(RpcError::Protocol("truncated close".into()));
                }
                let reason = CloseReason::from_byte(buf.get_u8())?;
                let raw = get_bytes_lenprefixed(&mut buf)?;
                let message = String::from_utf8(raw.to_vec())
                    .map_err(|e| RpcError::Protocol(format!("close message utf8: {e}")))?;
                Ok(Frame::Close { reason, message })
            }
            other => Ok(Frame::Unknown { tag: other }),
        }
    }
}

/// Helper: does this buffer look like a Granville frame at all (marker
/// check only, no tag validation)? Useful for discriminating against
/// other UDP traffic sharing a port (spec §4.2).
pub fn looks_like_frame(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[0..3] == FRAME_MARKER
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GrainKey;

    fn roundtrip(frame: Frame) {
        let bytes = frame.encode().unwrap();
        let back = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, back);
    }

    #[test]
    fn handshake_roundtrips() {
        roundtrip(Frame::Handshake {
            protocol_version: PROTOCOL_VERSION,
            peer_id: Uuid::nil(),
            role: Role::Client,
            capabilities: Capabilities::STREAMING,
        });
    }

    #[test]
    fn request_roundtrips_with_compound_key() {
        let grain_id = GrainId::new(
            3,
            GrainKey::Compound(vec![GrainKey::Integer(0), GrainKey::Integer(0)]),
        );
        roundtrip(Frame::Request {
            correlation_id: 42,
            grain_id,
            interface_id: 7,
            method_index: 1,
            delivery_mode: 0,
            flags: RequestFlags::NONE,
            deadline_ms: 30_000,
            arguments: Bytes::from_static(b"hello"),
        });
    }

    #[test]
    fn response_roundtrips() {
        roundtrip(Frame::Response {
            correlation_id: 42,
            status: Status::Ok,
            flags: ResponseFlags::END_OF_STREAM,
            payload: Bytes::from_static(b"world"),
        });
    }

    #[test]
    fn close_roundtrips() {
        roundtrip(Frame::Close {
            reason: CloseReason::VersionMismatch,
            message: "bad version".to_string(),
        });
    }

    #[test]
    fn unknown_tag_is_tolerated_not_an_error() {
        let mut bytes = BytesMut::new();
        bytes.put_slice(&FRAME_MARKER);
        bytes.put_u8(0xEE);
        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, Frame::Unknown { tag: 0xEE });
    }

    #[test]
    fn bad_marker_is_rejected() {
        let mut bytes = BytesMut::new();
        bytes.put_slice(&[0x00, 0x00, 0x00]);
        bytes.put_u8(tag::HEARTBEAT);
        bytes.put_u64_le(0);
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn grain_key_string_roundtrips_through_request() {
        let grain_id = GrainId::with_string_key(1, "player-1");
        roundtrip(Frame::OneWay {
            grain_id,
            interface_id: 2,
            method_index: 0,
            delivery_mode: 2,
            flags: RequestFlags::NONE,
            deadline_ms: 0,
            arguments: Bytes::new(),
        });
    }
}

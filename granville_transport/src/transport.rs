//! Datagram Transport API (spec §4.1).
//!
//! Abstract contract consumed by Connections (C4). Implementations are free
//! to run however they like internally; the only hard requirements are the
//! delivery guarantees per [`DeliveryMode`] and a bounded `connect` timeout.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use granville_shared::model::DeliveryMode;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Reason a session closed (spec §4.1 "Failure semantics").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCloseReason {
    /// The local side closed the session deliberately.
    LocalClose,
    /// The remote side closed the session (e.g. sent a transport-level close).
    PeerClosed,
    /// A reliable delivery could not be completed after retry.
    DeliveryFailed,
    /// No traffic observed within the idle bound.
    Idle,
    /// Any other transport-internal fault.
    Error(String),
}

impl fmt::Display for SessionCloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionCloseReason::LocalClose => write!(f, "local close"),
            SessionCloseReason::PeerClosed => write!(f, "peer closed"),
            SessionCloseReason::DeliveryFailed => write!(f, "delivery failed"),
            SessionCloseReason::Idle => write!(f, "idle timeout"),
            SessionCloseReason::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Events a transport emits for a session (spec §4.1).
#[derive(Debug)]
pub enum TransportEvent {
    DataReceived { bytes: Bytes, mode: DeliveryMode },
    LatencySample { round_trip: Duration },
    Closed { reason: SessionCloseReason },
}

/// A live duplex datagram session to one peer.
///
/// Cheap to clone: sending and the event stream are independent handles onto
/// shared session state.
#[async_trait]
pub trait Session: Send + Sync {
    fn remote_addr(&self) -> SocketAddr;
    fn local_addr(&self) -> SocketAddr;

    /// Enqueues a datagram for delivery under the given mode (spec §4.1).
    async fn send(&self, bytes: Bytes, mode: DeliveryMode) -> Result<(), TransportError>;

    /// Closes the session from this side, notifying the peer best-effort.
    async fn close(&self);
}

/// Handle to a session plus its event stream, returned by `connect`/`accept`.
pub struct SessionHandle {
    pub session: std::sync::Arc<dyn Session>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// A bound listener accepting inbound sessions.
#[async_trait]
pub trait Listener: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    /// Waits for and returns the next inbound session.
    async fn accept(&self) -> Result<SessionHandle, TransportError>;
}

/// Abstract duplex packet channel contract (spec §4.1 "C1").
///
/// Two implementations are expected to be able to coexist in a real
/// deployment (two different game-oriented reliable/unreliable channel
/// libraries); one is selected at runtime via [`granville_shared::config::TransportKind`].
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Begins accepting inbound sessions on `local_endpoint`.
    async fn listen(
        &self,
        local_endpoint: SocketAddr,
    ) -> Result<Box<dyn Listener>, TransportError>;

    /// Initiates a client-side session. Fails with
    /// `ConnectFailed{kind:Timeout}` if the peer does not accept within
    /// `timeout`.
    async fn connect(
        &self,
        remote_endpoint: SocketAddr,
        timeout: Duration,
    ) -> Result<SessionHandle, TransportError>;

    /// Maximum payload size this transport can carry in one datagram. The
    /// protocol layer above must not assume larger frames fit.
    fn max_datagram_size(&self) -> usize;

    /// The transport's configured polling cadence; callers must not assume
    /// lower latency than this.
    fn poll_interval(&self) -> Duration;
}

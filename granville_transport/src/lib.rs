//! Pluggable datagram transport (C1) and the connection endpoint (C4) built
//! on top of it.

pub mod connection;
pub mod error;
pub mod memory;
pub mod transport;
pub mod udp;

pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use error::TransportError;
pub use transport::{DatagramTransport, Listener, Session, SessionCloseReason, SessionHandle, TransportEvent};
pub use udp::UdpTransport;

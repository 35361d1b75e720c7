//! Deterministic in-memory [`DatagramTransport`] used only by tests that need
//! to control reordering and drops without real sockets (spec §4.1's
//! "two implementations must be able to coexist" note, taken here to mean
//! unit tests should not depend on OS UDP scheduling for their outcomes).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use granville_shared::errors::TransportErrorKind;
use granville_shared::model::DeliveryMode;
use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;
use crate::transport::{
    DatagramTransport, Listener, Session, SessionCloseReason, SessionHandle, TransportEvent,
};

/// A fault the harness should inject on the next send of a given mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Drop,
    /// Deliver the *next* message before this one.
    Reorder,
}

struct Registry {
    listeners: HashMap<SocketAddr, mpsc::Sender<(SocketAddr, SessionHandle)>>,
}

/// Shared switchboard that [`MemoryTransport`] instances register listeners
/// with and route connects through. Construct one and hand clones of its
/// `Arc` to every transport instance in a test.
#[derive(Clone)]
pub struct MemorySwitchboard {
    inner: Arc<Mutex<Registry>>,
    port_counter: Arc<AtomicU16>,
}

impl Default for MemorySwitchboard {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                listeners: HashMap::new(),
            })),
            port_counter: Arc::new(AtomicU16::new(1)),
        }
    }
}

impl MemorySwitchboard {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_ephemeral(&self) -> SocketAddr {
        let port = 20000 + self.port_counter.fetch_add(1, Ordering::Relaxed);
        format!("127.0.0.1:{port}").parse().unwrap()
    }
}

struct PeerEnd {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    peer_inbound: mpsc::Sender<(Bytes, DeliveryMode)>,
    fault_queue: Arc<Mutex<Vec<Fault>>>,
    held: Arc<Mutex<Option<(Bytes, DeliveryMode)>>>,
}

#[async_trait]
impl Session for PeerEnd {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send(&self, bytes: Bytes, mode: DeliveryMode) -> Result<(), TransportError> {
        let fault = self.fault_queue.lock().await.pop();
        match fault {
            Some(Fault::Drop) => Ok(()),
            Some(Fault::Reorder) => {
                let mut held = self.held.lock().await;
                if let Some((held_bytes, held_mode)) = held.take() {
                    self.peer_inbound
                        .send((bytes, mode))
                        .await
                        .map_err(|_| closed_err())?;
                    self.peer_inbound
                        .send((held_bytes, held_mode))
                        .await
                        .map_err(|_| closed_err())?;
                } else {
                    *held = Some((bytes, mode));
                }
                Ok(())
            }
            None => self
                .peer_inbound
                .send((bytes, mode))
                .await
                .map_err(|_| closed_err()),
        }
    }

    async fn close(&self) {}
}

fn closed_err() -> TransportError {
    TransportError::new(TransportErrorKind::NetworkError, "peer session closed")
}

/// Test-only transport that wires sessions directly together through
/// in-process channels, with an optional per-session [`Fault`] queue a test
/// can populate to force a drop or a reorder on a specific send.
pub struct MemoryTransport {
    switchboard: MemorySwitchboard,
    local_endpoint: Mutex<Option<SocketAddr>>,
}

impl MemoryTransport {
    pub fn new(switchboard: MemorySwitchboard) -> Self {
        Self {
            switchboard,
            local_endpoint: Mutex::new(None),
        }
    }
}

#[async_trait]
impl DatagramTransport for MemoryTransport {
    async fn listen(
        &self,
        local_endpoint: SocketAddr,
    ) -> Result<Box<dyn Listener>, TransportError> {
        let (accept_tx, accept_rx) = mpsc::channel(64);
        self.switchboard
            .inner
            .lock()
            .await
            .listeners
            .insert(local_endpoint, accept_tx);
        *self.local_endpoint.lock().await = Some(local_endpoint);
        Ok(Box::new(MemoryListener {
            local_addr: local_endpoint,
            accept_rx: Mutex::new(accept_rx),
        }))
    }

    async fn connect(
        &self,
        remote_endpoint: SocketAddr,
        timeout: Duration,
    ) -> Result<SessionHandle, TransportError> {
        let listener_tx = {
            let reg = self.switchboard.inner.lock().await;
            reg.listeners.get(&remote_endpoint).cloned()
        };
        let Some(listener_tx) = listener_tx else {
            return Err(TransportError::new(
                TransportErrorKind::Timeout,
                "no listener bound at that address",
            ));
        };

        let local_addr = self.switchboard.next_ephemeral();

        let (client_events_tx, client_events_rx) = mpsc::channel(256);
        let (server_events_tx, server_events_rx) = mpsc::channel(256);
        let (client_inbound_tx, client_inbound_rx) = mpsc::channel(256);
        let (server_inbound_tx, server_inbound_rx) = mpsc::channel(256);

        let client_session = Arc::new(PeerEnd {
            remote_addr: remote_endpoint,
            local_addr,
            peer_inbound: server_inbound_tx,
            fault_queue: Arc::new(Mutex::new(Vec::new())),
            held: Arc::new(Mutex::new(None)),
        });
        let server_session = Arc::new(PeerEnd {
            remote_addr: local_addr,
            local_addr: remote_endpoint,
            peer_inbound: client_inbound_tx,
            fault_queue: Arc::new(Mutex::new(Vec::new())),
            held: Arc::new(Mutex::new(None)),
        });

        tokio::spawn(pump(client_inbound_rx, client_events_tx));
        tokio::spawn(pump(server_inbound_rx, server_events_tx));

        let server_handle = SessionHandle {
            session: server_session,
            events: server_events_rx,
        };

        if tokio::time::timeout(timeout, listener_tx.send((local_addr, server_handle)))
            .await
            .is_err()
        {
            return Err(TransportError::new(
                TransportErrorKind::Timeout,
                "listener did not accept in time",
            ));
        }

        Ok(SessionHandle {
            session: client_session,
            events: client_events_rx,
        })
    }

    fn max_datagram_size(&self) -> usize {
        64 * 1024
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(1)
    }
}

async fn pump(
    mut inbound: mpsc::Receiver<(Bytes, DeliveryMode)>,
    events_tx: mpsc::Sender<TransportEvent>,
) {
    while let Some((bytes, mode)) = inbound.recv().await {
        if events_tx
            .send(TransportEvent::DataReceived { bytes, mode })
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = events_tx
        .send(TransportEvent::Closed {
            reason: SessionCloseReason::PeerClosed,
        })
        .await;
}

pub struct MemoryListener {
    local_addr: SocketAddr,
    accept_rx: Mutex<mpsc::Receiver<(SocketAddr, SessionHandle)>>,
}

#[async_trait]
impl Listener for MemoryListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&self) -> Result<SessionHandle, TransportError> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .map(|(_, handle)| handle)
            .ok_or_else(|| TransportError::new(TransportErrorKind::NetworkError, "listener closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_without_listener_times_out() {
        let switchboard = MemorySwitchboard::new();
        let transport = MemoryTransport::new(switchboard);
        let err = transport
            .connect("127.0.0.1:9999".parse().unwrap(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Timeout);
    }

    #[tokio::test]
    async fn connect_and_accept_exchange_data() {
        let switchboard = MemorySwitchboard::new();
        let server_addr: SocketAddr = "127.0.0.1:30001".parse().unwrap();

        let server_transport = MemoryTransport::new(switchboard.clone());
        let listener = server_transport.listen(server_addr).await.unwrap();

        let client_transport = MemoryTransport::new(switchboard);
        let accept_task = tokio::spawn(async move { listener.accept().await });
        let client_handle = client_transport
            .connect(server_addr, Duration::from_secs(1))
            .await
            .unwrap();
        let mut server_handle = accept_task.await.unwrap().unwrap();

        client_handle
            .session
            .send(Bytes::from_static(b"ping"), DeliveryMode::Unreliable)
            .await
            .unwrap();

        let event = server_handle.events.recv().await.unwrap();
        match event {
            TransportEvent::DataReceived { bytes, .. } => assert_eq!(&bytes[..], b"ping"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

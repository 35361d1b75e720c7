//! UDP implementation of the [`DatagramTransport`] contract (spec §4.1).
//!
//! UDP itself gives us neither sessions nor reliability, so this module adds
//! a small transport-private envelope (distinct from the Granville wire
//! frames in `granville_shared::wire`) carrying a session-establishment
//! handshake and a sequence-numbered ack/retransmit layer for `Reliable` and
//! `ReliableOrdered` sends. `Unreliable` sends skip all of that and go
//! straight to the socket.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use granville_shared::errors::TransportErrorKind;
use granville_shared::model::DeliveryMode;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::transport::{
    DatagramTransport, Listener, Session, SessionCloseReason, SessionHandle, TransportEvent,
};

const MAX_DATAGRAM_SIZE: usize = 60 * 1024;
const MAX_RETRIES: u32 = 10;
const DEDUPE_WINDOW: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvelopeKind {
    Syn,
    SynAck,
    Reject,
    Reliable,
    ReliableOrdered,
    Unreliable,
    Ack,
    Close,
}

impl EnvelopeKind {
    fn to_byte(self) -> u8 {
        match self {
            EnvelopeKind::Syn => 0,
            EnvelopeKind::SynAck => 1,
            EnvelopeKind::Reject => 2,
            EnvelopeKind::Reliable => 3,
            EnvelopeKind::ReliableOrdered => 4,
            EnvelopeKind::Unreliable => 5,
            EnvelopeKind::Ack => 6,
            EnvelopeKind::Close => 7,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => EnvelopeKind::Syn,
            1 => EnvelopeKind::SynAck,
            2 => EnvelopeKind::Reject,
            3 => EnvelopeKind::Reliable,
            4 => EnvelopeKind::ReliableOrdered,
            5 => EnvelopeKind::Unreliable,
            6 => EnvelopeKind::Ack,
            7 => EnvelopeKind::Close,
            _ => return None,
        })
    }
}

struct Envelope {
    kind: EnvelopeKind,
    seq: u32,
    payload: Bytes,
}

impl Envelope {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + self.payload.len());
        buf.put_u8(self.kind.to_byte());
        buf.put_u32_le(self.seq);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 5 {
            return None;
        }
        let mut buf = Bytes::copy_from_slice(bytes);
        let kind = EnvelopeKind::from_byte(buf.get_u8())?;
        let seq = buf.get_u32_le();
        Some(Envelope {
            kind,
            seq,
            payload: buf,
        })
    }
}

fn delivery_to_kind(mode: DeliveryMode) -> EnvelopeKind {
    match mode {
        DeliveryMode::Reliable => EnvelopeKind::Reliable,
        DeliveryMode::ReliableOrdered => EnvelopeKind::ReliableOrdered,
        DeliveryMode::Unreliable => EnvelopeKind::Unreliable,
    }
}

/// Raw I/O source for one session's background task: either an exclusively
/// owned (connected) socket, or a slice of a listener's shared socket
/// demultiplexed by peer address.
enum PeerIo {
    Owned(Arc<UdpSocket>),
    Demuxed {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        inbound: mpsc::Receiver<Vec<u8>>,
    },
}

impl PeerIo {
    async fn recv(&mut self) -> std::io::Result<Vec<u8>> {
        match self {
            PeerIo::Owned(socket) => {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                let n = socket.recv(&mut buf).await?;
                buf.truncate(n);
                Ok(buf)
            }
            PeerIo::Demuxed { inbound, .. } => inbound
                .recv()
                .await
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "closed")),
        }
    }

    async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            PeerIo::Owned(socket) => socket.send(bytes).await.map(|_| ()),
            PeerIo::Demuxed { socket, peer, .. } => socket.send_to(bytes, *peer).await.map(|_| ()),
        }
    }
}

struct SessionShared {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    send_tx: mpsc::Sender<(Bytes, DeliveryMode)>,
    close_tx: Mutex<Option<mpsc::Sender<()>>>,
}

pub struct UdpSession {
    shared: Arc<SessionShared>,
}

#[async_trait]
impl Session for UdpSession {
    fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    async fn send(&self, bytes: Bytes, mode: DeliveryMode) -> Result<(), TransportError> {
        self.shared
            .send_tx
            .send((bytes, mode))
            .await
            .map_err(|_| TransportError::new(TransportErrorKind::NetworkError, "session closed"))
    }

    async fn close(&self) {
        if let Some(tx) = self.shared.close_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }
    }
}

/// Drives one session's ack/retransmit state machine for its whole lifetime.
async fn run_session(
    mut io: PeerIo,
    remote_addr: SocketAddr,
    mut send_rx: mpsc::Receiver<(Bytes, DeliveryMode)>,
    events_tx: mpsc::Sender<TransportEvent>,
    mut close_rx: mpsc::Receiver<()>,
    poll_interval: Duration,
) {
    let mut next_send_seq: u32 = 0;
    let mut unacked: HashMap<u32, (Instant, Bytes)> = HashMap::new();
    let mut retry_count: HashMap<u32, u32> = HashMap::new();

    let mut next_expected_seq: u32 = 0;
    let mut reorder: BTreeMap<u32, Bytes> = BTreeMap::new();
    let mut seen_unordered: HashSet<u32> = HashSet::new();
    let mut seen_order: std::collections::VecDeque<u32> = std::collections::VecDeque::new();

    let retransmit_interval = poll_interval.max(Duration::from_millis(10)) * 4;
    let mut retransmit_tick = tokio::time::interval(retransmit_interval);

    loop {
        tokio::select! {
            biased;

            _ = close_rx.recv() => {
                let _ = io.send(&Envelope { kind: EnvelopeKind::Close, seq: 0, payload: Bytes::new() }.encode()).await;
                let _ = events_tx.send(TransportEvent::Closed { reason: SessionCloseReason::LocalClose }).await;
                return;
            }

            outgoing = send_rx.recv() => {
                let Some((payload, mode)) = outgoing else {
                    let _ = events_tx.send(TransportEvent::Closed { reason: SessionCloseReason::LocalClose }).await;
                    return;
                };
                let kind = delivery_to_kind(mode);
                let seq = next_send_seq;
                next_send_seq = next_send_seq.wrapping_add(1);
                let envelope = Envelope { kind, seq, payload: payload.clone() };
                let encoded = envelope.encode();
                if io.send(&encoded).await.is_err() {
                    let _ = events_tx.send(TransportEvent::Closed { reason: SessionCloseReason::Error("send failed".into()) }).await;
                    return;
                }
                if matches!(mode, DeliveryMode::Reliable | DeliveryMode::ReliableOrdered) {
                    unacked.insert(seq, (Instant::now(), encoded));
                    retry_count.insert(seq, 0);
                }
            }

            raw = io.recv() => {
                let Ok(raw) = raw else {
                    let _ = events_tx.send(TransportEvent::Closed { reason: SessionCloseReason::PeerClosed }).await;
                    return;
                };
                let Some(envelope) = Envelope::decode(&raw) else {
                    trace!(%remote_addr, "dropping malformed transport envelope");
                    continue;
                };
                match envelope.kind {
                    EnvelopeKind::Ack => {
                        if let Some((sent_at, _)) = unacked.remove(&envelope.seq) {
                            let _ = events_tx.send(TransportEvent::LatencySample {
                                round_trip: sent_at.elapsed(),
                            }).await;
                        }
                        retry_count.remove(&envelope.seq);
                    }
                    EnvelopeKind::Close => {
                        let _ = events_tx.send(TransportEvent::Closed { reason: SessionCloseReason::PeerClosed }).await;
                        return;
                    }
                    EnvelopeKind::Unreliable => {
                        let _ = events_tx.send(TransportEvent::DataReceived { bytes: envelope.payload, mode: DeliveryMode::Unreliable }).await;
                    }
                    EnvelopeKind::Reliable => {
                        let ack = Envelope { kind: EnvelopeKind::Ack, seq: envelope.seq, payload: Bytes::new() }.encode();
                        let _ = io.send(&ack).await;
                        if seen_unordered.insert(envelope.seq) {
                            if seen_order.len() >= DEDUPE_WINDOW {
                                if let Some(old) = seen_order.pop_front() {
                                    seen_unordered.remove(&old);
                                }
                            }
                            seen_order.push_back(envelope.seq);
                            let _ = events_tx.send(TransportEvent::DataReceived { bytes: envelope.payload, mode: DeliveryMode::Reliable }).await;
                        }
                    }
                    EnvelopeKind::ReliableOrdered => {
                        let ack = Envelope { kind: EnvelopeKind::Ack, seq: envelope.seq, payload: Bytes::new() }.encode();
                        let _ = io.send(&ack).await;
                        if envelope.seq < next_expected_seq {
                            // duplicate of something already delivered.
                        } else if envelope.seq == next_expected_seq {
                            let _ = events_tx.send(TransportEvent::DataReceived { bytes: envelope.payload, mode: DeliveryMode::ReliableOrdered }).await;
                            next_expected_seq = next_expected_seq.wrapping_add(1);
                            while let Some(bytes) = reorder.remove(&next_expected_seq) {
                                let _ = events_tx.send(TransportEvent::DataReceived { bytes, mode: DeliveryMode::ReliableOrdered }).await;
                                next_expected_seq = next_expected_seq.wrapping_add(1);
                            }
                        } else {
                            reorder.insert(envelope.seq, envelope.payload);
                        }
                    }
                    EnvelopeKind::Syn | EnvelopeKind::SynAck | EnvelopeKind::Reject => {
                        debug!(%remote_addr, ?envelope.kind, "ignoring handshake envelope on established session");
                    }
                }
            }

            _ = retransmit_tick.tick() => {
                let mut failed = false;
                for (seq, attempts) in retry_count.iter_mut() {
                    if let Some((_, encoded)) = unacked.get(seq) {
                        if *attempts >= MAX_RETRIES {
                            failed = true;
                            break;
                        }
                        *attempts += 1;
                        let _ = io.send(encoded).await;
                    }
                }
                if failed {
                    let _ = events_tx.send(TransportEvent::Closed { reason: SessionCloseReason::DeliveryFailed }).await;
                    return;
                }
            }
        }
    }
}

fn spawn_session(
    io: PeerIo,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    poll_interval: Duration,
) -> SessionHandle {
    let (send_tx, send_rx) = mpsc::channel(256);
    let (events_tx, events_rx) = mpsc::channel(256);
    let (close_tx, close_rx) = mpsc::channel(1);

    tokio::spawn(run_session(
        io,
        remote_addr,
        send_rx,
        events_tx,
        close_rx,
        poll_interval,
    ));

    let shared = Arc::new(SessionShared {
        remote_addr,
        local_addr,
        send_tx,
        close_tx: Mutex::new(Some(close_tx)),
    });

    SessionHandle {
        session: shared_to_session(shared),
        events: events_rx,
    }
}

fn shared_to_session(shared: Arc<SessionShared>) -> Arc<dyn Session> {
    Arc::new(UdpSession { shared })
}

pub struct UdpTransport {
    poll_interval: Duration,
}

impl UdpTransport {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new(Duration::from_millis(15))
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn listen(
        &self,
        local_endpoint: SocketAddr,
    ) -> Result<Box<dyn Listener>, TransportError> {
        let socket = UdpSocket::bind(local_endpoint)
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::NetworkError, e.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::new(TransportErrorKind::NetworkError, e.to_string()))?;
        let socket = Arc::new(socket);

        let (accept_tx, accept_rx) = mpsc::channel(64);
        let demux: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let next_seq = Arc::new(AtomicU32::new(0));

        tokio::spawn(accept_loop(
            socket.clone(),
            accept_tx,
            demux,
            local_addr,
            self.poll_interval,
            next_seq,
        ));

        Ok(Box::new(UdpListener {
            local_addr,
            accept_rx: Mutex::new(accept_rx),
        }))
    }

    async fn connect(
        &self,
        remote_endpoint: SocketAddr,
        timeout: Duration,
    ) -> Result<SessionHandle, TransportError> {
        let bind_addr: SocketAddr = if remote_endpoint.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::NetworkError, e.to_string()))?;
        socket.connect(remote_endpoint).await.map_err(|e| {
            TransportError::new(TransportErrorKind::NetworkError, e.to_string())
        })?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::new(TransportErrorKind::NetworkError, e.to_string()))?;
        let socket = Arc::new(socket);

        let syn = Envelope {
            kind: EnvelopeKind::Syn,
            seq: 0,
            payload: Bytes::new(),
        }
        .encode();

        let deadline = Instant::now() + timeout;
        let mut attempt_interval = tokio::time::interval(Duration::from_millis(200));
        loop {
            if Instant::now() >= deadline {
                return Err(TransportError::new(
                    TransportErrorKind::Timeout,
                    "peer did not accept session within timeout",
                ));
            }
            socket.send(&syn).await.map_err(|e| {
                TransportError::new(TransportErrorKind::NetworkError, e.to_string())
            })?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = remaining.min(Duration::from_millis(200));
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            tokio::select! {
                recv = tokio::time::timeout(wait, socket.recv(&mut buf)) => {
                    match recv {
                        Ok(Ok(n)) => {
                            if let Some(env) = Envelope::decode(&buf[..n]) {
                                match env.kind {
                                    EnvelopeKind::SynAck => break,
                                    EnvelopeKind::Reject => {
                                        return Err(TransportError::new(TransportErrorKind::Rejected, "peer rejected session"));
                                    }
                                    _ => continue,
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            return Err(TransportError::new(TransportErrorKind::NetworkError, e.to_string()));
                        }
                        Err(_) => continue,
                    }
                }
                _ = attempt_interval.tick() => continue,
            }
        }

        Ok(spawn_session(
            PeerIo::Owned(socket),
            remote_endpoint,
            local_addr,
            self.poll_interval,
        ))
    }

    fn max_datagram_size(&self) -> usize {
        MAX_DATAGRAM_SIZE
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

async fn accept_loop(
    socket: Arc<UdpSocket>,
    accept_tx: mpsc::Sender<SessionHandle>,
    demux: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>,
    local_addr: SocketAddr,
    poll_interval: Duration,
    _next_seq: Arc<AtomicU32>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "udp accept loop recv failed");
                return;
            }
        };
        let data = buf[..n].to_vec();

        let existing = {
            let map = demux.lock().await;
            map.get(&from).cloned()
        };

        if let Some(tx) = existing {
            let _ = tx.send(data).await;
            continue;
        }

        let Some(envelope) = Envelope::decode(&data) else {
            continue;
        };
        if envelope.kind != EnvelopeKind::Syn {
            continue;
        }

        let synack = Envelope {
            kind: EnvelopeKind::SynAck,
            seq: 0,
            payload: Bytes::new(),
        }
        .encode();
        if socket.send_to(&synack, from).await.is_err() {
            continue;
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        demux.lock().await.insert(from, inbound_tx);

        let handle = spawn_session(
            PeerIo::Demuxed {
                socket: socket.clone(),
                peer: from,
                inbound: inbound_rx,
            },
            from,
            local_addr,
            poll_interval,
        );

        if accept_tx.send(handle).await.is_err() {
            return;
        }
    }
}

pub struct UdpListener {
    local_addr: SocketAddr,
    accept_rx: Mutex<mpsc::Receiver<SessionHandle>>,
}

#[async_trait]
impl Listener for UdpListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&self) -> Result<SessionHandle, TransportError> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TransportError::new(TransportErrorKind::NetworkError, "listener closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_and_exchange_reliable_message() {
        let server = UdpTransport::default();
        let listener = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = listener.local_addr();

        let accept_task = tokio::spawn(async move { listener.accept().await });

        let client = UdpTransport::default();
        let client_handle = client
            .connect(server_addr, Duration::from_secs(2))
            .await
            .unwrap();

        let mut server_handle = accept_task.await.unwrap().unwrap();

        client_handle
            .session
            .send(Bytes::from_static(b"hello"), DeliveryMode::Reliable)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), server_handle.events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            TransportEvent::DataReceived { bytes, mode } => {
                assert_eq!(&bytes[..], b"hello");
                assert_eq!(mode, DeliveryMode::Reliable);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reliable_ordered_delivers_in_submission_order() {
        let server = UdpTransport::default();
        let listener = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = listener.local_addr();
        let accept_task = tokio::spawn(async move { listener.accept().await });

        let client = UdpTransport::default();
        let client_handle = client
            .connect(server_addr, Duration::from_secs(2))
            .await
            .unwrap();
        let mut server_handle = accept_task.await.unwrap().unwrap();

        for i in 0..20u32 {
            client_handle
                .session
                .send(Bytes::copy_from_slice(&i.to_le_bytes()), DeliveryMode::ReliableOrdered)
                .await
                .unwrap();
        }

        let mut received = Vec::new();
        while received.len() < 20 {
            let event = tokio::time::timeout(Duration::from_secs(2), server_handle.events.recv())
                .await
                .unwrap()
                .unwrap();
            if let TransportEvent::DataReceived { bytes, .. } = event {
                received.push(u32::from_le_bytes(bytes[..4].try_into().unwrap()));
            }
        }
        assert_eq!(received, (0..20).collect::<Vec<_>>());
    }
}

//! Connection Endpoint (spec §4.4): the state machine sitting between a
//! transport [`Session`] and the application layer (server invocation engine
//! or client multiplexer), responsible for handshake/manifest exchange,
//! heartbeats, and in-flight call bookkeeping.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use granville_shared::config::RpcConfig;
use granville_shared::errors::RpcError;
use granville_shared::model::{GrainId, Invocation, Manifest};
use granville_shared::serialization::{decode_with, encode_with};
use granville_shared::wire::{CloseReason, Frame, Role, Status};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::transport::{SessionHandle, TransportEvent};

/// Coarse connection lifecycle (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    HandshakingManifest,
    Connected,
    Closing,
    Closed,
    Failed,
}

/// Something the application layer on top of a [`Connection`] needs to react
/// to: an inbound invocation to dispatch, or a lifecycle change.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// An inbound `Request` or `OneWay` frame to be dispatched by the
    /// embedder (server invocation engine).
    Invocation {
        correlation_id: u64,
        grain_id: GrainId,
        interface_id: u32,
        method_index: u16,
        arguments: Bytes,
        deadline_ms: u32,
        one_way: bool,
    },
    ManifestUpdated(Manifest),
    StateChanged(ConnectionState),
    Closed,
}

enum Command {
    Call {
        invocation: Invocation,
        respond_to: oneshot::Sender<Result<Bytes, RpcError>>,
    },
    CallOneWay {
        invocation: Invocation,
        respond_to: oneshot::Sender<Result<(), RpcError>>,
    },
    CallStream {
        invocation: Invocation,
        respond_to: oneshot::Sender<Result<mpsc::Receiver<Result<Bytes, RpcError>>, RpcError>>,
    },
    Respond {
        correlation_id: u64,
        status: Status,
        flags: granville_shared::wire::ResponseFlags,
        payload: Bytes,
    },
    Close,
}

enum PendingCall {
    Unary {
        deadline: Instant,
        respond_to: oneshot::Sender<Result<Bytes, RpcError>>,
    },
    Streaming {
        deadline: Instant,
        tx: mpsc::Sender<Result<Bytes, RpcError>>,
    },
}

impl PendingCall {
    fn deadline(&self) -> Instant {
        match self {
            PendingCall::Unary { deadline, .. } => *deadline,
            PendingCall::Streaming { deadline, .. } => *deadline,
        }
    }
}

/// One live peer connection: handshake/manifest state, the pending-call
/// table, and the heartbeat loop, all driven by a single background task so
/// no two operations race over the same state (same rationale as the
/// multiplexer's single-writer actor in spec §9).
pub struct Connection {
    cmd_tx: mpsc::Sender<Command>,
    events_rx: Mutex<mpsc::Receiver<ConnectionEvent>>,
    remote_addr: SocketAddr,
    peer_id: Uuid,
    manifest: Mutex<Option<Manifest>>,
    call_timeout_ms: u32,
}

/// Runs an opaque payload through the C3 serialization session boundary
/// (spec §4.3): fresh buffer per message, soft cap enforced before the bytes
/// ever reach the wire. Both request arguments and response payloads are
/// "opaque" from this connection's point of view — it never looks inside
/// them, only enforces size.
fn encode_session_bytes(payload: &[u8], cap: usize) -> Result<Bytes, RpcError> {
    encode_with(cap, |w: &mut BytesMut| w.extend_from_slice(payload))
}

/// Receive-side counterpart of [`encode_session_bytes`]: enforces the same
/// cap on inbound opaque bytes before they're handed to the application.
fn decode_session_bytes(payload: Bytes, cap: usize) -> Result<Bytes, RpcError> {
    decode_with(payload, cap, |view| Ok(Bytes::copy_from_slice(view)))
}

fn delivery_mode_byte(mode: granville_shared::model::DeliveryMode) -> u8 {
    match mode {
        granville_shared::model::DeliveryMode::Reliable => 0,
        granville_shared::model::DeliveryMode::ReliableOrdered => 1,
        granville_shared::model::DeliveryMode::Unreliable => 2,
    }
}

impl Connection {
    /// Client-side: send the first `Handshake`, then wait for `HandshakeAck`
    /// and the peer's `Manifest` before the connection is usable.
    pub async fn connect_as_client(
        session: SessionHandle,
        local_peer_id: Uuid,
        local_manifest: Manifest,
        config: &RpcConfig,
    ) -> Result<Self, RpcError> {
        let SessionHandle {
            session: transport_session,
            mut events,
        } = session;

        send_frame(
            &transport_session,
            Frame::Handshake {
                protocol_version: granville_shared::wire::PROTOCOL_VERSION,
                peer_id: local_peer_id,
                role: Role::Client,
                capabilities: granville_shared::wire::Capabilities::NONE,
            },
        )
        .await?;

        let handshake_timeout = config.handshake_timeout();
        let deadline = Instant::now() + handshake_timeout;
        let peer_id = loop {
            let frame = recv_frame_before(&mut events, deadline).await?;
            match frame {
                Frame::HandshakeAck {
                    protocol_version,
                    peer_id,
                    ..
                } => {
                    if protocol_version != granville_shared::wire::PROTOCOL_VERSION {
                        return Err(RpcError::Protocol(format!(
                            "peer speaks protocol v{protocol_version}, expected v{}",
                            granville_shared::wire::PROTOCOL_VERSION
                        )));
                    }
                    break peer_id;
                }
                Frame::Close { reason, message } => {
                    return Err(RpcError::Protocol(format!(
                        "peer closed during handshake: {reason:?}: {message}"
                    )))
                }
                _ => continue,
            }
        };

        send_frame(
            &transport_session,
            Frame::Manifest {
                manifest_version: 1,
                payload: local_manifest,
            },
        )
        .await?;

        let peer_manifest = loop {
            let frame = recv_frame_before(&mut events, deadline).await?;
            match frame {
                Frame::Manifest { payload, .. } => {
                    send_frame(
                        &transport_session,
                        Frame::ManifestAck { manifest_version: 1 },
                    )
                    .await?;
                    break payload;
                }
                Frame::ManifestAck { .. } => continue,
                Frame::Close { reason, message } => {
                    return Err(RpcError::Protocol(format!(
                        "peer closed during manifest exchange: {reason:?}: {message}"
                    )))
                }
                _ => continue,
            }
        };

        Ok(Self::spawn(
            transport_session,
            events,
            peer_id,
            peer_manifest,
            config.clone(),
        ))
    }

    /// Server-side: wait for the client's `Handshake`, ack it, exchange our
    /// own manifest, then hand off to the steady-state driver.
    pub async fn accept_as_server(
        session: SessionHandle,
        local_peer_id: Uuid,
        local_manifest: Manifest,
        config: &RpcConfig,
    ) -> Result<Self, RpcError> {
        let SessionHandle {
            session: transport_session,
            mut events,
        } = session;

        let handshake_timeout = config.handshake_timeout();
        let deadline = Instant::now() + handshake_timeout;

        let peer_id = loop {
            let frame = recv_frame_before(&mut events, deadline).await?;
            match frame {
                Frame::Handshake {
                    protocol_version,
                    peer_id,
                    ..
                } => {
                    if protocol_version != granville_shared::wire::PROTOCOL_VERSION {
                        send_frame(
                            &transport_session,
                            Frame::Close {
                                reason: CloseReason::VersionMismatch,
                                message: "unsupported protocol version".into(),
                            },
                        )
                        .await
                        .ok();
                        return Err(RpcError::Protocol(format!(
                            "peer requested protocol v{protocol_version}"
                        )));
                    }
                    break peer_id;
                }
                _ => continue,
            }
        };

        send_frame(
            &transport_session,
            Frame::HandshakeAck {
                protocol_version: granville_shared::wire::PROTOCOL_VERSION,
                peer_id: local_peer_id,
                manifest_version: 1,
            },
        )
        .await?;

        send_frame(
            &transport_session,
            Frame::Manifest {
                manifest_version: 1,
                payload: local_manifest,
            },
        )
        .await?;

        let peer_manifest = loop {
            let frame = recv_frame_before(&mut events, deadline).await?;
            match frame {
                Frame::ManifestAck { .. } => break Manifest::default(),
                Frame::Manifest { payload, .. } => {
                    send_frame(
                        &transport_session,
                        Frame::ManifestAck { manifest_version: 1 },
                    )
                    .await?;
                    break payload;
                }
                _ => continue,
            }
        };

        Ok(Self::spawn(
            transport_session,
            events,
            peer_id,
            peer_manifest,
            config.clone(),
        ))
    }

    fn spawn(
        session: Arc<dyn crate::transport::Session>,
        events: mpsc::Receiver<TransportEvent>,
        peer_id: Uuid,
        manifest: Manifest,
        config: RpcConfig,
    ) -> Self {
        let remote_addr = session.remote_addr();
        let call_timeout_ms = config.call_timeout_ms;
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(256);

        tokio::spawn(drive(session, events, cmd_rx, events_tx, config));

        Self {
            cmd_tx,
            events_rx: Mutex::new(events_rx),
            remote_addr,
            peer_id,
            manifest: Mutex::new(Some(manifest)),
            call_timeout_ms,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// Deadline (ms) this connection's config was built with
    /// (`RpcConfig.call_timeout_ms`); used as the fallback deadline by
    /// proxies that don't specify one explicitly.
    pub fn call_timeout_ms(&self) -> u32 {
        self.call_timeout_ms
    }

    pub async fn manifest(&self) -> Option<Manifest> {
        self.manifest.lock().await.clone()
    }

    /// Issues a request and awaits its response, honoring `invocation`'s
    /// deadline (spec §4.5 "Timeouts").
    pub async fn call(&self, invocation: Invocation) -> Result<Bytes, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Call {
                invocation,
                respond_to: tx,
            })
            .await
            .map_err(|_| RpcError::Disconnected)?;
        rx.await.map_err(|_| RpcError::Disconnected)?
    }

    /// Issues a request whose response may arrive as multiple chunks (spec
    /// §4.6): each item is one `Response` payload, and the stream ends when
    /// the peer sets `END_OF_STREAM` or the call errors.
    pub async fn call_stream(
        &self,
        invocation: Invocation,
    ) -> Result<mpsc::Receiver<Result<Bytes, RpcError>>, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::CallStream {
                invocation,
                respond_to: tx,
            })
            .await
            .map_err(|_| RpcError::Disconnected)?;
        rx.await.map_err(|_| RpcError::Disconnected)?
    }

    /// Sends a fire-and-forget request; spec §4.5: "no Response is ever
    /// produced, so failures after the datagram leaves the transport are
    /// invisible to the caller."
    pub async fn call_one_way(&self, invocation: Invocation) -> Result<(), RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::CallOneWay {
                invocation,
                respond_to: tx,
            })
            .await
            .map_err(|_| RpcError::Disconnected)?;
        rx.await.map_err(|_| RpcError::Disconnected)?
    }

    /// Sends a `Response` frame for an inbound invocation the embedder has
    /// finished dispatching. Streaming responses (spec §4.6) call this once
    /// per chunk, setting `END_OF_STREAM` on the last one.
    pub async fn respond(
        &self,
        correlation_id: u64,
        status: Status,
        flags: granville_shared::wire::ResponseFlags,
        payload: Bytes,
    ) -> Result<(), RpcError> {
        self.cmd_tx
            .send(Command::Respond {
                correlation_id,
                status,
                flags,
                payload,
            })
            .await
            .map_err(|_| RpcError::Disconnected)
    }

    pub async fn next_event(&self) -> Option<ConnectionEvent> {
        self.events_rx.lock().await.recv().await
    }

    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
    }
}

async fn send_frame(
    session: &Arc<dyn crate::transport::Session>,
    frame: Frame,
) -> Result<(), RpcError> {
    let bytes = frame.encode()?;
    session
        .send(bytes, granville_shared::model::DeliveryMode::Reliable)
        .await
        .map_err(RpcError::from)
}

async fn recv_frame_before(
    events: &mut mpsc::Receiver<TransportEvent>,
    deadline: Instant,
) -> Result<Frame, RpcError> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RpcError::Timeout);
        }
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Some(TransportEvent::DataReceived { bytes, .. })) => {
                return Frame::decode(&bytes);
            }
            Ok(Some(TransportEvent::LatencySample { .. })) => continue,
            Ok(Some(TransportEvent::Closed { .. })) => return Err(RpcError::Disconnected),
            Ok(None) => return Err(RpcError::Disconnected),
            Err(_) => return Err(RpcError::Timeout),
        }
    }
}

/// The background task owning everything about one connection: decodes
/// inbound frames, completes pending calls, surfaces inbound invocations,
/// and runs the heartbeat/timeout sweep. Single-writer by construction —
/// `Command`s are the only way anything outside this task mutates state.
async fn drive(
    session: Arc<dyn crate::transport::Session>,
    mut events: mpsc::Receiver<TransportEvent>,
    mut commands: mpsc::Receiver<Command>,
    out_events: mpsc::Sender<ConnectionEvent>,
    config: RpcConfig,
) {
    let mut pending: HashMap<u64, PendingCall> = HashMap::new();
    let mut next_correlation_id: u64 = 1;
    let mut missed_heartbeats: u32 = 0;
    let mut awaiting_heartbeat_ack: Option<u64> = None;

    let mut heartbeat_tick = tokio::time::interval(config.heartbeat_interval());

    let _ = out_events
        .send(ConnectionEvent::StateChanged(ConnectionState::Connected))
        .await;

    loop {
        // Pinned to the soonest pending call's own deadline rather than a
        // fixed tick, so the timeout sweep fires right when it's due instead
        // of up to one tick period late (spec §8: timeout within ±20ms).
        // Recomputed fresh every loop pass, so a call added with a shorter
        // deadline than anything currently pending is picked up immediately.
        let next_deadline = pending.values().map(|call| call.deadline()).min();
        let sweep = async {
            match next_deadline {
                Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break; };
                match cmd {
                    Command::Call { invocation, respond_to } => {
                        let correlation_id = next_correlation_id;
                        next_correlation_id = next_correlation_id.wrapping_add(1);
                        let arguments = match encode_session_bytes(&invocation.arguments, config.max_payload_bytes) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                let _ = respond_to.send(Err(e));
                                continue;
                            }
                        };
                        let frame = Frame::Request {
                            correlation_id,
                            grain_id: invocation.grain_id,
                            interface_id: invocation.interface_id,
                            method_index: invocation.method_index,
                            delivery_mode: delivery_mode_byte(invocation.options.delivery_mode),
                            flags: granville_shared::wire::RequestFlags::NONE,
                            deadline_ms: invocation.options.deadline_ms,
                            arguments,
                        };
                        match frame.encode() {
                            Ok(bytes) => {
                                if let Err(e) = session.send(bytes, invocation.options.delivery_mode).await {
                                    let _ = respond_to.send(Err(RpcError::from(e)));
                                    continue;
                                }
                                pending.insert(correlation_id, PendingCall::Unary {
                                    deadline: Instant::now() + Duration::from_millis(invocation.options.deadline_ms as u64),
                                    respond_to,
                                });
                            }
                            Err(e) => {
                                let _ = respond_to.send(Err(e));
                            }
                        }
                    }
                    Command::CallStream { invocation, respond_to } => {
                        let correlation_id = next_correlation_id;
                        next_correlation_id = next_correlation_id.wrapping_add(1);
                        let arguments = match encode_session_bytes(&invocation.arguments, config.max_payload_bytes) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                let _ = respond_to.send(Err(e));
                                continue;
                            }
                        };
                        let frame = Frame::Request {
                            correlation_id,
                            grain_id: invocation.grain_id,
                            interface_id: invocation.interface_id,
                            method_index: invocation.method_index,
                            delivery_mode: delivery_mode_byte(invocation.options.delivery_mode),
                            flags: granville_shared::wire::RequestFlags::NONE,
                            deadline_ms: invocation.options.deadline_ms,
                            arguments,
                        };
                        match frame.encode() {
                            Ok(bytes) => {
                                if let Err(e) = session.send(bytes, invocation.options.delivery_mode).await {
                                    let _ = respond_to.send(Err(RpcError::from(e)));
                                    continue;
                                }
                                let (chunk_tx, chunk_rx) = mpsc::channel(32);
                                pending.insert(correlation_id, PendingCall::Streaming {
                                    deadline: Instant::now() + Duration::from_millis(invocation.options.deadline_ms as u64),
                                    tx: chunk_tx,
                                });
                                let _ = respond_to.send(Ok(chunk_rx));
                            }
                            Err(e) => {
                                let _ = respond_to.send(Err(e));
                            }
                        }
                    }
                    Command::CallOneWay { invocation, respond_to } => {
                        let result = match encode_session_bytes(&invocation.arguments, config.max_payload_bytes) {
                            Ok(arguments) => {
                                let frame = Frame::OneWay {
                                    grain_id: invocation.grain_id,
                                    interface_id: invocation.interface_id,
                                    method_index: invocation.method_index,
                                    delivery_mode: delivery_mode_byte(invocation.options.delivery_mode),
                                    flags: granville_shared::wire::RequestFlags::NONE,
                                    deadline_ms: invocation.options.deadline_ms,
                                    arguments,
                                };
                                match frame.encode() {
                                    Ok(bytes) => session.send(bytes, invocation.options.delivery_mode).await.map_err(RpcError::from),
                                    Err(e) => Err(e),
                                }
                            }
                            Err(e) => Err(e),
                        };
                        let _ = respond_to.send(result);
                    }
                    Command::Respond { correlation_id, status, flags, payload } => {
                        match encode_session_bytes(&payload, config.max_payload_bytes) {
                            Ok(payload) => {
                                let frame = Frame::Response {
                                    correlation_id,
                                    status,
                                    flags,
                                    payload,
                                };
                                if let Ok(bytes) = frame.encode() {
                                    let _ = session.send(bytes, granville_shared::model::DeliveryMode::Reliable).await;
                                }
                            }
                            Err(e) => {
                                warn!(%correlation_id, error = %e, "response payload rejected by serialization boundary");
                            }
                        }
                    }
                    Command::Close => {
                        session.close().await;
                        break;
                    }
                }
            }

            incoming = events.recv() => {
                let Some(event) = incoming else { break; };
                match event {
                    TransportEvent::DataReceived { bytes, .. } => {
                        let frame = match Frame::decode(&bytes) {
                            Ok(f) => f,
                            Err(e) => {
                                warn!(error = %e, "dropping undecodable frame");
                                continue;
                            }
                        };
                        match frame {
                            Frame::Response { correlation_id, status, flags, payload } => {
                                let result = match status {
                                    Status::Ok => decode_session_bytes(payload, config.max_payload_bytes),
                                    Status::Error => Err(RpcError::Peer { message: String::from_utf8_lossy(&payload).into_owned() }),
                                    Status::Canceled => Err(RpcError::Canceled),
                                    Status::MethodUnknown => Err(RpcError::MethodUnknown),
                                    Status::GrainUnknown => Err(RpcError::GrainUnknown),
                                    Status::Overloaded => Err(RpcError::Overloaded),
                                };
                                let is_final = status != Status::Ok
                                    || flags.contains(granville_shared::wire::ResponseFlags::END_OF_STREAM);
                                match pending.get(&correlation_id) {
                                    Some(PendingCall::Streaming { .. }) => {
                                        if is_final {
                                            if let Some(PendingCall::Streaming { tx, .. }) = pending.remove(&correlation_id) {
                                                let _ = tx.send(result).await;
                                            }
                                        } else if let Some(PendingCall::Streaming { tx, .. }) = pending.get(&correlation_id) {
                                            let _ = tx.send(result).await;
                                        }
                                    }
                                    Some(PendingCall::Unary { .. }) => {
                                        if let Some(PendingCall::Unary { respond_to, .. }) = pending.remove(&correlation_id) {
                                            let _ = respond_to.send(result);
                                        }
                                    }
                                    None => {}
                                }
                            }
                            Frame::Request { correlation_id, grain_id, interface_id, method_index, deadline_ms, arguments, .. } => {
                                match decode_session_bytes(arguments, config.max_payload_bytes) {
                                    Ok(arguments) => {
                                        let _ = out_events.send(ConnectionEvent::Invocation {
                                            correlation_id,
                                            grain_id,
                                            interface_id,
                                            method_index,
                                            arguments,
                                            deadline_ms,
                                            one_way: false,
                                        }).await;
                                    }
                                    Err(e) => warn!(%correlation_id, error = %e, "inbound request rejected by serialization boundary"),
                                }
                            }
                            Frame::OneWay { grain_id, interface_id, method_index, deadline_ms, arguments, .. } => {
                                match decode_session_bytes(arguments, config.max_payload_bytes) {
                                    Ok(arguments) => {
                                        let _ = out_events.send(ConnectionEvent::Invocation {
                                            correlation_id: 0,
                                            grain_id,
                                            interface_id,
                                            method_index,
                                            arguments,
                                            deadline_ms,
                                            one_way: true,
                                        }).await;
                                    }
                                    Err(e) => warn!(error = %e, "inbound one-way call rejected by serialization boundary"),
                                }
                            }
                            Frame::Heartbeat { send_time_ms } => {
                                let ack = Frame::HeartbeatAck { send_time_ms };
                                if let Ok(bytes) = ack.encode() {
                                    let _ = session.send(bytes, granville_shared::model::DeliveryMode::Unreliable).await;
                                }
                            }
                            Frame::HeartbeatAck { send_time_ms } => {
                                if awaiting_heartbeat_ack == Some(send_time_ms) {
                                    awaiting_heartbeat_ack = None;
                                    missed_heartbeats = 0;
                                }
                            }
                            Frame::Manifest { payload, .. } => {
                                let _ = out_events.send(ConnectionEvent::ManifestUpdated(payload)).await;
                            }
                            Frame::Close { reason, message } => {
                                debug!(?reason, %message, "peer sent close");
                                break;
                            }
                            Frame::Handshake { .. } | Frame::HandshakeAck { .. } | Frame::ManifestAck { .. } | Frame::Unknown { .. } => {
                                trace!("ignoring frame outside handshake phase");
                            }
                        }
                    }
                    TransportEvent::LatencySample { round_trip } => {
                        trace!(round_trip_ms = round_trip.as_millis() as u64, "latency sample");
                    }
                    TransportEvent::Closed { .. } => break,
                }
            }

            _ = heartbeat_tick.tick() => {
                if awaiting_heartbeat_ack.is_some() {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= config.missed_heartbeat_threshold {
                        let _ = out_events.send(ConnectionEvent::Closed).await;
                        break;
                    }
                }
                let now_ms = now_millis();
                awaiting_heartbeat_ack = Some(now_ms);
                let frame = Frame::Heartbeat { send_time_ms: now_ms };
                if let Ok(bytes) = frame.encode() {
                    let _ = session.send(bytes, granville_shared::model::DeliveryMode::Unreliable).await;
                }
            }

            _ = sweep => {
                let now = Instant::now();
                let expired: Vec<u64> = pending.iter()
                    .filter(|(_, call)| call.deadline() <= now)
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    if let Some(call) = pending.remove(&id) {
                        match call {
                            PendingCall::Unary { respond_to, .. } => {
                                let _ = respond_to.send(Err(RpcError::Timeout));
                            }
                            PendingCall::Streaming { tx, .. } => {
                                let _ = tx.send(Err(RpcError::Timeout)).await;
                            }
                        }
                    }
                }
            }
        }
    }

    for (_, call) in pending.drain() {
        match call {
            PendingCall::Unary { respond_to, .. } => {
                let _ = respond_to.send(Err(RpcError::Disconnected));
            }
            PendingCall::Streaming { tx, .. } => {
                let _ = tx.send(Err(RpcError::Disconnected)).await;
            }
        }
    }
    let _ = out_events.send(ConnectionEvent::Closed).await;
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

//! Client multiplexer (spec §4.7 / C7): owns one [`Connection`] per
//! registered server, connecting eagerly or lazily, reconnecting with capped
//! backoff, and periodically checking health. Single-writer actor, same
//! rationale as [`Connection`]'s own `drive()` task: every mutation of the
//! server table goes through one command channel so nothing races.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use granville_shared::config::RpcConfig;
use granville_shared::errors::RpcError;
use granville_shared::model::{
    GrainId, Invocation, InvocationOptions, Manifest, RoutingContext, ServerDescriptor, ServerHealth,
};
use granville_transport::{Connection, DatagramTransport, UdpTransport};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::reference::{CallDispatch, GrainRef, SharedRoutingContext};
use crate::routing::RoutingStrategy;

/// Reserved interface/grain used by the multiplexer's own health probe
/// (spec §4.7: "a lightweight request, e.g., a reserved 'server-time'
/// call"). No real grain ever claims interface id 0, so the server's
/// invocation engine answers with a fast `GrainUnknown` — that round trip
/// alone is enough to prove the connection and the peer's engine are alive.
const HEALTH_PROBE_INTERFACE_ID: u32 = 0;
const HEALTH_PROBE_METHOD_INDEX: u16 = 0;

fn health_probe_invocation(timeout: Duration) -> Invocation {
    Invocation {
        grain_id: GrainId::with_string_key(HEALTH_PROBE_INTERFACE_ID, "__health_probe__"),
        interface_id: HEALTH_PROBE_INTERFACE_ID,
        method_index: HEALTH_PROBE_METHOD_INDEX,
        arguments: Vec::new(),
        options: InvocationOptions {
            deadline_ms: timeout.as_millis() as u32,
            ..Default::default()
        },
    }
}

/// A server's health transitioned, as observed by the periodic probe (spec
/// §6 `server_health_changed`).
#[derive(Debug, Clone)]
pub struct ServerHealthChanged {
    pub server_id: String,
    pub health: ServerHealth,
}

enum Command {
    Register {
        descriptor: ServerDescriptor,
    },
    Unregister {
        server_id: String,
    },
    Connect {
        server_id: String,
        respond_to: oneshot::Sender<Result<Arc<Connection>, RpcError>>,
    },
    Route {
        context: RoutingContext,
        respond_to: oneshot::Sender<Result<Arc<Connection>, RpcError>>,
    },
    Descriptors {
        respond_to: oneshot::Sender<Vec<ServerDescriptor>>,
    },
    ConnectionDied {
        server_id: String,
    },
}

struct ServerEntry {
    descriptor: ServerDescriptor,
    connection: Option<Arc<Connection>>,
    backoff_ms: u32,
    last_attempt: Option<Instant>,
}

impl ServerEntry {
    fn new(descriptor: ServerDescriptor, base_backoff_ms: u32) -> Self {
        Self {
            descriptor,
            connection: None,
            backoff_ms: base_backoff_ms,
            last_attempt: None,
        }
    }
}

/// Handle to the running multiplexer actor. Cheap to clone (it's just a
/// channel sender plus a broadcast sender handle).
#[derive(Clone)]
pub struct ClientMultiplexer {
    cmd_tx: mpsc::Sender<Command>,
    health_tx: broadcast::Sender<ServerHealthChanged>,
    call_timeout_ms: u32,
}

impl ClientMultiplexer {
    /// Spawns the actor task. `local_manifest` is advertised to every peer
    /// this multiplexer connects to.
    pub fn spawn(
        cfg: RpcConfig,
        local_manifest: Manifest,
        routing: Arc<dyn RoutingStrategy>,
    ) -> Self {
        let call_timeout_ms = cfg.call_timeout_ms;
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (health_tx, _) = broadcast::channel(64);
        let self_tx = cmd_tx.clone();
        let actor_health_tx = health_tx.clone();
        tokio::spawn(run_actor(cfg, local_manifest, routing, cmd_rx, self_tx, actor_health_tx));
        Self {
            cmd_tx,
            health_tx,
            call_timeout_ms,
        }
    }

    /// Subscribes to health transitions observed by the periodic probe
    /// (spec §6 `server_health_changed`). Lagging subscribers miss events
    /// rather than block the actor; they can resync via [`descriptors`].
    pub fn subscribe_health_events(&self) -> broadcast::Receiver<ServerHealthChanged> {
        self.health_tx.subscribe()
    }

    /// Returns a grain reference that re-resolves its target server through
    /// `context` on every call (spec §4.6/§4.7: resolution happens at call
    /// time, not once at construction) rather than binding to one fixed
    /// `Connection`. `context` is a shared handle: mutating it after this
    /// call changes where the *next* call through the returned reference
    /// routes, without rebuilding the reference (spec §8 zone-handoff
    /// scenario).
    pub fn get_grain(
        &self,
        context: SharedRoutingContext,
        grain_id: GrainId,
        interface_id: u32,
    ) -> GrainRef<MultiplexedDispatch> {
        GrainRef::new(
            Arc::new(MultiplexedDispatch {
                mux: self.clone(),
                context,
            }),
            grain_id,
            interface_id,
        )
    }

    pub async fn register(&self, descriptor: ServerDescriptor) {
        let _ = self.cmd_tx.send(Command::Register { descriptor }).await;
    }

    pub async fn unregister(&self, server_id: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(Command::Unregister {
                server_id: server_id.into(),
            })
            .await;
    }

    /// Returns the connection for `server_id`, connecting it now if it
    /// isn't already connected (used by eager callers and by `route`).
    pub async fn get_connection(
        &self,
        server_id: impl Into<String>,
    ) -> Result<Arc<Connection>, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect {
                server_id: server_id.into(),
                respond_to: tx,
            })
            .await
            .map_err(|_| RpcError::Disconnected)?;
        rx.await.map_err(|_| RpcError::Disconnected)?
    }

    /// Picks a server via the configured [`RoutingStrategy`] and returns its
    /// (possibly freshly established) connection.
    pub async fn route(&self, context: RoutingContext) -> Result<Arc<Connection>, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Route {
                context,
                respond_to: tx,
            })
            .await
            .map_err(|_| RpcError::Disconnected)?;
        rx.await.map_err(|_| RpcError::Disconnected)?
    }

    /// Snapshot of the currently registered servers, for diagnostics.
    pub async fn descriptors(&self) -> Vec<ServerDescriptor> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Descriptors { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// [`CallDispatch`] that re-resolves its target connection through the owning
/// multiplexer's routing strategy before every call, rather than binding to
/// one fixed `Connection` (spec §4.6/§4.7). Returned by
/// [`ClientMultiplexer::get_grain`].
pub struct MultiplexedDispatch {
    mux: ClientMultiplexer,
    context: SharedRoutingContext,
}

#[async_trait]
impl CallDispatch for MultiplexedDispatch {
    async fn call(&self, invocation: Invocation) -> Result<Bytes, RpcError> {
        let connection = self.mux.route(self.context.snapshot()).await?;
        connection.call(invocation).await
    }

    async fn call_stream(
        &self,
        invocation: Invocation,
    ) -> Result<mpsc::Receiver<Result<Bytes, RpcError>>, RpcError> {
        let connection = self.mux.route(self.context.snapshot()).await?;
        connection.call_stream(invocation).await
    }

    async fn call_one_way(&self, invocation: Invocation) -> Result<(), RpcError> {
        let connection = self.mux.route(self.context.snapshot()).await?;
        connection.call_one_way(invocation).await
    }

    fn call_timeout_ms(&self) -> u32 {
        self.mux.call_timeout_ms
    }
}

async fn run_actor(
    cfg: RpcConfig,
    local_manifest: Manifest,
    routing: Arc<dyn RoutingStrategy>,
    mut commands: mpsc::Receiver<Command>,
    self_tx: mpsc::Sender<Command>,
    health_tx: broadcast::Sender<ServerHealthChanged>,
) {
    let transport = UdpTransport::default();
    let local_peer_id = Uuid::new_v4();
    let mut servers: HashMap<String, ServerEntry> = HashMap::new();
    let mut health_tick = tokio::time::interval(cfg.health_check_interval());

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break; };
                match cmd {
                    Command::Register { descriptor } => {
                        let id = descriptor.server_id.clone();
                        let eager = cfg.eager_connect;
                        let entry = servers
                            .entry(id.clone())
                            .or_insert_with(|| ServerEntry::new(descriptor.clone(), cfg.reconnect_backoff_base_ms));
                        entry.descriptor = descriptor;
                        if eager {
                            let _ = ensure_connected(
                                &mut servers, &id, &transport, local_peer_id, &local_manifest, &cfg, &self_tx,
                            ).await;
                        }
                    }
                    Command::Unregister { server_id } => {
                        if let Some(entry) = servers.remove(&server_id) {
                            if let Some(conn) = entry.connection {
                                conn.close().await;
                            }
                        }
                    }
                    Command::Connect { server_id, respond_to } => {
                        let result = ensure_connected(
                            &mut servers, &server_id, &transport, local_peer_id, &local_manifest, &cfg, &self_tx,
                        ).await;
                        let _ = respond_to.send(result);
                    }
                    Command::Route { context, respond_to } => {
                        let descriptors: Vec<ServerDescriptor> =
                            servers.values().map(|e| e.descriptor.clone()).collect();
                        let chosen = routing.select(&descriptors, &context).map(|d| d.server_id.clone());
                        let result = match chosen {
                            Ok(id) => ensure_connected(
                                &mut servers, &id, &transport, local_peer_id, &local_manifest, &cfg, &self_tx,
                            ).await,
                            Err(e) => Err(e),
                        };
                        let _ = respond_to.send(result);
                    }
                    Command::Descriptors { respond_to } => {
                        let _ = respond_to.send(servers.values().map(|e| e.descriptor.clone()).collect());
                    }
                    Command::ConnectionDied { server_id } => {
                        if let Some(entry) = servers.get_mut(&server_id) {
                            entry.connection = None;
                            entry.descriptor.mark_health_checked(ServerHealth::Offline);
                            debug!(%server_id, "connection died, will reconnect on demand");
                        }
                    }
                }
            }
            _ = health_tick.tick() => {
                run_health_sweep(&mut servers, &cfg, &health_tx).await;
            }
        }
    }
}

/// Returns the server's live connection, establishing one if needed
/// (respecting the reconnect backoff if the last attempt failed recently).
async fn ensure_connected(
    servers: &mut HashMap<String, ServerEntry>,
    server_id: &str,
    transport: &UdpTransport,
    local_peer_id: Uuid,
    local_manifest: &Manifest,
    cfg: &RpcConfig,
    self_tx: &mpsc::Sender<Command>,
) -> Result<Arc<Connection>, RpcError> {
    let Some(entry) = servers.get(server_id) else {
        return Err(RpcError::Routing);
    };

    if let Some(conn) = &entry.connection {
        return Ok(conn.clone());
    }

    if let Some(last_attempt) = entry.last_attempt {
        let wait = Duration::from_millis(entry.backoff_ms as u64);
        if last_attempt.elapsed() < wait {
            return Err(RpcError::transport(
                granville_shared::errors::TransportErrorKind::Timeout,
                "server in reconnect backoff",
            ));
        }
    }

    let addr: SocketAddr = match entry.descriptor.addr().parse() {
        Ok(addr) => addr,
        Err(e) => return Err(RpcError::Protocol(format!("bad server address: {e}"))),
    };

    let entry = servers.get_mut(server_id).expect("checked above");
    entry.last_attempt = Some(Instant::now());

    let connect_result = transport
        .connect(addr, cfg.connect_timeout())
        .await
        .map_err(RpcError::from);

    let session = match connect_result {
        Ok(session) => session,
        Err(e) => {
            warn!(%server_id, error = %e, "connect failed");
            bump_backoff(entry, cfg);
            entry.descriptor.mark_health_checked(ServerHealth::Offline);
            return Err(e);
        }
    };

    let connection = match Connection::connect_as_client(session, local_peer_id, local_manifest.clone(), cfg).await {
        Ok(connection) => Arc::new(connection),
        Err(e) => {
            warn!(%server_id, error = %e, "handshake failed");
            bump_backoff(entry, cfg);
            entry.descriptor.mark_health_checked(ServerHealth::Offline);
            return Err(e);
        }
    };

    entry.backoff_ms = cfg.reconnect_backoff_base_ms;
    entry.descriptor.mark_health_checked(ServerHealth::Healthy);
    entry.connection = Some(connection.clone());
    info!(%server_id, "connected");

    let watch_id = server_id.to_string();
    let watch_conn = connection.clone();
    let watch_tx = self_tx.clone();
    tokio::spawn(async move {
        loop {
            match watch_conn.next_event().await {
                Some(granville_transport::ConnectionEvent::Closed) | None => {
                    let _ = watch_tx.send(Command::ConnectionDied { server_id: watch_id }).await;
                    return;
                }
                Some(_) => continue,
            }
        }
    });

    Ok(connection)
}

fn bump_backoff(entry: &mut ServerEntry, cfg: &RpcConfig) {
    entry.backoff_ms = (entry.backoff_ms.saturating_mul(2)).min(cfg.reconnect_backoff_cap_ms);
}

/// Probes every connected server with a lightweight request (spec §4.7),
/// updates `ServerDescriptor.health` on the result, and broadcasts
/// transitions. Then, if configured, removes servers that have stayed
/// Offline past `unhealthy_threshold_ms`.
async fn run_health_sweep(
    servers: &mut HashMap<String, ServerEntry>,
    cfg: &RpcConfig,
    health_tx: &broadcast::Sender<ServerHealthChanged>,
) {
    let probe_timeout = cfg.connect_timeout();
    let ids: Vec<String> = servers
        .iter()
        .filter(|(_, e)| e.connection.is_some())
        .map(|(id, _)| id.clone())
        .collect();

    for id in ids {
        let Some(connection) = servers.get(&id).and_then(|e| e.connection.clone()) else {
            continue;
        };
        let responsive = match connection.call(health_probe_invocation(probe_timeout)).await {
            Ok(_) => true,
            // The probe's grain id is never registered, so a conforming peer
            // answers GrainUnknown; that round trip alone proves it's alive.
            Err(e) if e.is_call_local() => true,
            Err(_) => false,
        };
        let new_health = if responsive {
            ServerHealth::Healthy
        } else {
            ServerHealth::Unhealthy
        };
        if let Some(entry) = servers.get_mut(&id) {
            let changed = entry.descriptor.health != new_health;
            entry.descriptor.mark_health_checked(new_health);
            if changed {
                debug!(server_id = %id, health = %new_health, "server health changed");
                let _ = health_tx.send(ServerHealthChanged {
                    server_id: id.clone(),
                    health: new_health,
                });
            }
        }
    }

    if !cfg.auto_remove_unhealthy {
        return;
    }
    let stale: Vec<String> = servers
        .iter()
        .filter(|(_, e)| {
            e.connection.is_none()
                && e.descriptor
                    .last_health_check
                    .map(|_| matches!(e.descriptor.health, ServerHealth::Offline))
                    .unwrap_or(false)
                && e.last_attempt
                    .map(|t| t.elapsed() >= Duration::from_millis(cfg.unhealthy_threshold_ms as u64))
                    .unwrap_or(false)
        })
        .map(|(id, _)| id.clone())
        .collect();
    for id in stale {
        info!(server_id = %id, "auto-removing unhealthy server");
        servers.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::PrimaryRoutingStrategy;

    #[tokio::test]
    async fn route_with_no_registered_servers_errors() {
        let mux = ClientMultiplexer::spawn(
            RpcConfig::default(),
            Manifest::default(),
            Arc::new(PrimaryRoutingStrategy),
        );
        let err = mux.route(RoutingContext::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::Routing));
    }

    #[tokio::test]
    async fn descriptors_reflects_registration() {
        let mux = ClientMultiplexer::spawn(
            RpcConfig::default(),
            Manifest::default(),
            Arc::new(PrimaryRoutingStrategy),
        );
        mux.register(ServerDescriptor::new("s1", "127.0.0.1", 40001)).await;
        let descriptors = mux.descriptors().await;
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].server_id, "s1");
    }
}

//! Top-level RPC server: binds a transport listener, upgrades each accepted
//! session into a handshaked [`Connection`], and runs the invocation engine
//! against it (spec §4.4, §4.5).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use granville_shared::config::RpcConfig;
use granville_shared::console::{Console, CvarFlags, CvarValue};
use granville_transport::{Connection, DatagramTransport, UdpTransport};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatcher::ActivationDispatcher;
use crate::engine::InvocationEngine;

/// Running server instance: owns the listener loop and the set of live
/// connections it has accepted.
pub struct RpcServer {
    pub cfg: RpcConfig,
    pub console: Console,
    peer_id: Uuid,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl RpcServer {
    pub fn new(cfg: RpcConfig) -> Self {
        let mut console = Console::new();
        Self::register_cvars(&mut console, &cfg);
        Self {
            cfg,
            console,
            peer_id: Uuid::new_v4(),
            local_addr: RwLock::new(None),
        }
    }

    fn register_cvars(console: &mut Console, cfg: &RpcConfig) {
        console.register_cvar(
            "rpc_call_timeout_ms",
            CvarValue::Int(cfg.call_timeout_ms as i64),
            "Default per-call deadline in milliseconds",
            CvarFlags::NONE,
        );
        console.register_cvar(
            "rpc_heartbeat_interval_ms",
            CvarValue::Int(cfg.heartbeat_interval_ms as i64),
            "Idle-keepalive cadence in milliseconds",
            CvarFlags::NONE,
        );
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    /// Binds the configured transport and serves connections against
    /// `dispatcher` until the process is torn down. Each accepted session
    /// gets its own handshake and its own `InvocationEngine` task.
    pub async fn serve<D: ActivationDispatcher + 'static>(
        self: Arc<Self>,
        dispatcher: Arc<D>,
    ) -> anyhow::Result<()> {
        let transport = UdpTransport::default();
        let bind_addr: SocketAddr = self.cfg.listen_addr.parse().context("parse listen_addr")?;
        let listener = transport.listen(bind_addr).await.map_err(|e| anyhow::anyhow!(e))?;
        *self.local_addr.write().await = Some(listener.local_addr());
        info!(addr = %listener.local_addr(), "granville server listening");

        loop {
            let session = match listener.accept().await {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let remote = session.session.remote_addr();
            info!(%remote, "accepted session");

            let cfg = self.cfg.clone();
            let peer_id = self.peer_id;
            let manifest = dispatcher.manifest();
            let dispatcher = dispatcher.clone();

            tokio::spawn(async move {
                let connection =
                    match Connection::accept_as_server(session, peer_id, manifest, &cfg).await {
                        Ok(connection) => Arc::new(connection),
                        Err(e) => {
                            warn!(%remote, error = %e, "handshake failed");
                            return;
                        }
                    };
                let engine = Arc::new(InvocationEngine::new(dispatcher, 256));
                engine.run(connection).await;
            });
        }
    }
}

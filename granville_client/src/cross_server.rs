//! Cross-server client (spec §4.9 / C9): lets a server call grains hosted on
//! *other* servers directly by address, bypassing zone routing entirely.
//! Used for fan-out notifications (e.g. "tell every zone server a player
//! logged in") rather than steady-state gameplay traffic.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use granville_shared::config::RpcConfig;
use granville_shared::errors::RpcError;
use granville_shared::model::{Invocation, Manifest};
use granville_transport::{Connection, DatagramTransport, UdpTransport};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

struct PooledConnection {
    connection: Arc<Connection>,
    last_used: Instant,
}

/// One fan-out target's outcome.
pub struct FanOutResult {
    pub target: String,
    pub result: Result<Bytes, RpcError>,
}

/// Pools connections by `host:port`, independent of the multiplexer's
/// zone-routed server table.
pub struct CrossServerClient {
    cfg: RpcConfig,
    local_peer_id: Uuid,
    local_manifest: Manifest,
    transport: UdpTransport,
    pool: Mutex<HashMap<String, PooledConnection>>,
}

impl CrossServerClient {
    /// Builds the client and starts its idle-connection reaper. The reaper
    /// holds only a `Weak` reference, so the client is dropped normally once
    /// nothing else references it.
    pub fn spawn(cfg: RpcConfig, local_manifest: Manifest) -> Arc<Self> {
        let client = Arc::new(Self {
            local_peer_id: Uuid::new_v4(),
            transport: UdpTransport::default(),
            local_manifest,
            pool: Mutex::new(HashMap::new()),
            cfg,
        });
        let weak = Arc::downgrade(&client);
        tokio::spawn(reap_loop(weak));
        client
    }

    /// Calls a grain hosted at `target` (`host:port`), honoring the
    /// configured cross-server fan-out timeout regardless of the
    /// invocation's own deadline.
    pub async fn call(&self, target: &str, invocation: Invocation) -> Result<Bytes, RpcError> {
        let connection = self.get_or_connect(target).await?;
        let timeout = Duration::from_millis(self.cfg.cross_server_fanout_timeout_ms as u64);
        match tokio::time::timeout(timeout, connection.call(invocation)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout),
        }
    }

    /// Calls every target concurrently with a fresh invocation built from
    /// `build_invocation`. Per-target failures never fail the whole fan-out:
    /// each is logged and reported back in its own [`FanOutResult`] so the
    /// caller decides whether a partial failure matters.
    pub async fn fan_out(
        self: &Arc<Self>,
        targets: &[String],
        build_invocation: impl Fn() -> Invocation,
    ) -> Vec<FanOutResult> {
        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let invocation = build_invocation();
            let target = target.clone();
            let client = self.clone();
            handles.push(async move {
                let result = client.call(&target, invocation).await;
                if let Err(e) = &result {
                    warn!(%target, error = %e, "cross-server fan-out call failed");
                }
                FanOutResult { target, result }
            });
        }
        futures_join_all(handles).await
    }

    async fn get_or_connect(&self, target: &str) -> Result<Arc<Connection>, RpcError> {
        {
            let mut pool = self.pool.lock().await;
            if let Some(entry) = pool.get_mut(target) {
                entry.last_used = Instant::now();
                return Ok(entry.connection.clone());
            }
        }

        let addr = target
            .parse()
            .map_err(|e| RpcError::Protocol(format!("bad cross-server address {target}: {e}")))?;
        let session = self
            .transport
            .connect(addr, self.cfg.connect_timeout())
            .await
            .map_err(RpcError::from)?;
        let connection = Arc::new(
            Connection::connect_as_client(session, self.local_peer_id, self.local_manifest.clone(), &self.cfg)
                .await?,
        );

        let mut pool = self.pool.lock().await;
        pool.insert(
            target.to_string(),
            PooledConnection {
                connection: connection.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(connection)
    }
}

/// Runs `futures` concurrently and collects results in order, without
/// pulling in the `futures` crate for a single combinator.
async fn futures_join_all<T>(futures: Vec<impl std::future::Future<Output = T>>) -> Vec<T> {
    let handles: Vec<_> = futures.into_iter().map(tokio::spawn).collect();
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(value) => out.push(value),
            Err(e) => warn!(error = %e, "fan-out task panicked"),
        }
    }
    out
}

async fn reap_loop(client: Weak<CrossServerClient>) {
    loop {
        let Some(client) = client.upgrade() else { return };
        let idle = Duration::from_millis(client.cfg.cross_server_idle_ms as u64);
        tokio::time::sleep(idle.min(Duration::from_secs(30)).max(Duration::from_secs(1))).await;
        let mut pool = client.pool.lock().await;
        pool.retain(|target, entry| {
            let keep = entry.last_used.elapsed() < idle;
            if !keep {
                tracing::debug!(%target, "reaping idle cross-server connection");
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_to_unparseable_target_is_a_protocol_error() {
        let client = CrossServerClient::spawn(RpcConfig::default(), Manifest::default());
        let err = client
            .call(
                "not-an-address",
                Invocation {
                    grain_id: granville_shared::model::GrainId::with_string_key(1, "x"),
                    interface_id: 1,
                    method_index: 0,
                    arguments: Vec::new(),
                    options: Default::default(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }
}

//! Configuration surface (spec §6).
//!
//! Loads Granville RPC configuration from JSON strings (file IO left to the
//! embedder), mirroring how `EngineConfig` works: a plain serde struct with
//! defaults, no builder ceremony.

use serde::{Deserialize, Serialize};

/// Which concrete [`granville_transport`] implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// The bundled Tokio UDP transport with a lightweight ack/retransmit layer.
    LiteTransportA,
    /// An alternate backend; selectable but not bundled in this workspace.
    LiteTransportB,
}

impl Default for TransportKind {
    fn default() -> Self {
        TransportKind::LiteTransportA
    }
}

/// Root configuration shared by client and server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Selects the datagram transport implementation (C1).
    #[serde(default)]
    pub transport: TransportKind,

    /// Server listen address, e.g. `0.0.0.0:40000`. Server-only.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Default delivery mode for Requests that don't specify one.
    #[serde(default = "default_reliable_default")]
    pub reliable_default: bool,

    /// Per-call deadline, unless the call overrides it explicitly.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u32,

    /// Bound on how long `connect` may take before `ConnectFailed{Timeout}`.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u32,

    /// Bound on how long the handshake/manifest exchange may take.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u32,

    /// Idle-keepalive cadence once Connected.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u32,

    /// Consecutive missed heartbeat acks before a session is marked Failed.
    #[serde(default = "default_missed_heartbeat_threshold")]
    pub missed_heartbeat_threshold: u32,

    /// Multiplexer health-check cadence.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u32,

    /// Reconnect backoff base (doubles each attempt, capped).
    #[serde(default = "default_reconnect_backoff_base_ms")]
    pub reconnect_backoff_base_ms: u32,

    /// Reconnect backoff cap.
    #[serde(default = "default_reconnect_backoff_cap_ms")]
    pub reconnect_backoff_cap_ms: u32,

    /// Soft cap on encoded payload size (§4.3).
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Whether the multiplexer auto-removes servers that stay Offline.
    #[serde(default)]
    pub auto_remove_unhealthy: bool,

    /// How long (ms) a server may remain Offline before auto-removal, if enabled.
    #[serde(default = "default_unhealthy_threshold_ms")]
    pub unhealthy_threshold_ms: u32,

    /// Whether the multiplexer connects eagerly on registration vs. lazily on first call.
    #[serde(default)]
    pub eager_connect: bool,

    /// Idle timeout for pooled cross-server connections (C9).
    #[serde(default = "default_cross_server_idle_ms")]
    pub cross_server_idle_ms: u32,

    /// Per-call timeout used by the cross-server fan-out client (C9).
    #[serde(default = "default_cross_server_fanout_timeout_ms")]
    pub cross_server_fanout_timeout_ms: u32,

    /// Transport poll cadence; the runtime must not assume tighter latency.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u32,
}

fn default_listen_addr() -> String {
    "0.0.0.0:40000".to_string()
}
fn default_reliable_default() -> bool {
    true
}
fn default_call_timeout_ms() -> u32 {
    30_000
}
fn default_connect_timeout_ms() -> u32 {
    5_000
}
fn default_handshake_timeout_ms() -> u32 {
    2_000
}
fn default_heartbeat_interval_ms() -> u32 {
    5_000
}
fn default_missed_heartbeat_threshold() -> u32 {
    2
}
fn default_health_check_interval_ms() -> u32 {
    30_000
}
fn default_reconnect_backoff_base_ms() -> u32 {
    2_000
}
fn default_reconnect_backoff_cap_ms() -> u32 {
    60_000
}
fn default_max_payload_bytes() -> usize {
    1024 * 1024
}
fn default_unhealthy_threshold_ms() -> u32 {
    u32::MAX
}
fn default_cross_server_idle_ms() -> u32 {
    5 * 60 * 1000
}
fn default_cross_server_fanout_timeout_ms() -> u32 {
    5_000
}
fn default_poll_interval_ms() -> u32 {
    15
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            listen_addr: default_listen_addr(),
            reliable_default: default_reliable_default(),
            call_timeout_ms: default_call_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            missed_heartbeat_threshold: default_missed_heartbeat_threshold(),
            health_check_interval_ms: default_health_check_interval_ms(),
            reconnect_backoff_base_ms: default_reconnect_backoff_base_ms(),
            reconnect_backoff_cap_ms: default_reconnect_backoff_cap_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            auto_remove_unhealthy: false,
            unhealthy_threshold_ms: default_unhealthy_threshold_ms(),
            eager_connect: false,
            cross_server_idle_ms: default_cross_server_idle_ms(),
            cross_server_fanout_timeout_ms: default_cross_server_fanout_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl RpcConfig {
    /// Parses configuration from a JSON string.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.call_timeout_ms as u64)
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connect_timeout_ms as u64)
    }

    pub fn handshake_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.handshake_timeout_ms as u64)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_ms as u64)
    }

    pub fn health_check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.health_check_interval_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = RpcConfig::default();
        assert_eq!(cfg.call_timeout_ms, 30_000);
        assert_eq!(cfg.connect_timeout_ms, 5_000);
        assert_eq!(cfg.handshake_timeout_ms, 2_000);
        assert_eq!(cfg.heartbeat_interval_ms, 5_000);
        assert_eq!(cfg.missed_heartbeat_threshold, 2);
        assert_eq!(cfg.reconnect_backoff_base_ms, 2_000);
        assert_eq!(cfg.reconnect_backoff_cap_ms, 60_000);
        assert_eq!(cfg.max_payload_bytes, 1024 * 1024);
        assert_eq!(cfg.cross_server_fanout_timeout_ms, 5_000);
        assert_eq!(cfg.cross_server_idle_ms, 5 * 60 * 1000);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let cfg = RpcConfig::from_json_str(r#"{"listen_addr":"127.0.0.1:9000"}"#).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.call_timeout_ms, 30_000);
    }
}

//! Data model (spec §3): `ServerDescriptor`, `GrainId`, `Invocation`,
//! `RoutingContext`, and the peer `Manifest`.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Health of a registered RPC server, as tracked by the multiplexer's
/// health monitor (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerHealth {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl Default for ServerHealth {
    fn default() -> Self {
        ServerHealth::Unknown
    }
}

impl fmt::Display for ServerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Identity of an RPC server (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub server_id: String,
    pub host: String,
    pub port: u16,
    /// Routing hints, e.g. `"zone" -> "0,0"`.
    pub metadata: HashMap<String, String>,
    pub is_primary: bool,
    pub health: ServerHealth,
    /// Unix millis of the last health probe, if any.
    pub last_health_check: Option<u64>,
}

impl ServerDescriptor {
    pub fn new(server_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            server_id: server_id.into(),
            host: host.into(),
            port,
            metadata: HashMap::new(),
            is_primary: false,
            health: ServerHealth::Unknown,
            last_health_check: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_primary(mut self, is_primary: bool) -> Self {
        self.is_primary = is_primary;
        self
    }

    pub fn with_health(mut self, health: ServerHealth) -> Self {
        self.health = health;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn zone(&self) -> Option<&str> {
        self.metadata.get("zone").map(String::as_str)
    }

    pub fn mark_health_checked(&mut self, health: ServerHealth) {
        self.health = health;
        self.last_health_check = Some(now_millis());
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Opaque key variant for a [`GrainId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrainKey {
    String(String),
    Integer(i64),
    Guid(uuid::Uuid),
    /// Ordered list of sub-keys, for compound keys (e.g. a world position).
    Compound(Vec<GrainKey>),
}

impl fmt::Display for GrainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrainKey::String(s) => write!(f, "{s}"),
            GrainKey::Integer(i) => write!(f, "{i}"),
            GrainKey::Guid(g) => write!(f, "{g}"),
            GrainKey::Compound(parts) => {
                write!(f, "(")?;
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Opaque compound identifier locating an activation on a server (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrainId {
    pub interface_type_id: u32,
    pub key: GrainKey,
}

impl GrainId {
    pub fn new(interface_type_id: u32, key: GrainKey) -> Self {
        Self {
            interface_type_id,
            key,
        }
    }

    pub fn with_string_key(interface_type_id: u32, key: impl Into<String>) -> Self {
        Self::new(interface_type_id, GrainKey::String(key.into()))
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grain[{}/{}]", self.interface_type_id, self.key)
    }
}

/// Delivery mode requested for a frame (spec §4.1/§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    Reliable,
    ReliableOrdered,
    Unreliable,
}

impl Default for DeliveryMode {
    fn default() -> Self {
        DeliveryMode::Reliable
    }
}

/// Per-call options riding alongside an [`Invocation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationOptions {
    pub delivery_mode: DeliveryMode,
    /// Milliseconds from send; 0 means "expire immediately" (tested in §8).
    pub deadline_ms: u32,
    /// True for `OneWay` sends: no Response will be produced.
    pub one_way: bool,
}

impl Default for InvocationOptions {
    /// `deadline_ms` here is only a fallback for callers that build options
    /// without a dispatcher in hand (tests, ad-hoc calls); real proxy calls
    /// get their deadline from `CallDispatch::call_timeout_ms`, which tracks
    /// `RpcConfig.call_timeout_ms` instead of this literal.
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Reliable,
            deadline_ms: 30_000,
            one_way: false,
        }
    }
}

/// One call's request payload (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub grain_id: GrainId,
    pub interface_id: u32,
    pub method_index: u16,
    pub arguments: Vec<u8>,
    pub options: InvocationOptions,
}

/// Peer's advertised grain/interface catalog (spec §3, §4.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub manifest_version: u32,
    /// interface_id -> (method_index -> method_name)
    pub interfaces: HashMap<u32, HashMap<u16, String>>,
    /// grain_type_id -> property map
    pub grain_types: HashMap<u32, HashMap<String, String>>,
}

impl Manifest {
    pub fn method_name(&self, interface_id: u32, method_index: u16) -> Option<&str> {
        self.interfaces
            .get(&interface_id)
            .and_then(|methods| methods.get(&method_index))
            .map(String::as_str)
    }

    pub fn method_index(&self, interface_id: u32, method_name: &str) -> Option<u16> {
        self.interfaces.get(&interface_id).and_then(|methods| {
            methods
                .iter()
                .find(|(_, name)| name.as_str() == method_name)
                .map(|(idx, _)| *idx)
        })
    }

    /// Registers an interface's methods, deriving indices via
    /// [`derive_method_indices`] rather than accepting caller-assigned ones.
    pub fn register_interface(&mut self, interface_id: u32, method_names: &[&str]) {
        let indices = derive_method_indices(method_names);
        let methods = self.interfaces.entry(interface_id).or_default();
        for (name, index) in indices {
            methods.insert(index, name);
        }
    }
}

/// Derives method indices by sorting method names ordinally (case-sensitive)
/// and numbering from 0 (spec §4.4). Server manifests and client codegen both
/// call this so the two sides agree without anyone typing matching numbers
/// on each end by hand.
pub fn derive_method_indices(method_names: &[&str]) -> HashMap<String, u16> {
    let mut sorted: Vec<&str> = method_names.to_vec();
    sorted.sort_unstable();
    sorted
        .into_iter()
        .enumerate()
        .map(|(i, name)| (name.to_string(), i as u16))
        .collect()
}

/// Same derivation as [`derive_method_indices`], returning just one method's
/// index. Used by the generated proxy, which knows a single method name at a
/// time rather than building the whole map.
pub fn method_index_of(method_names: &[&str], method_name: &str) -> u16 {
    let mut sorted: Vec<&str> = method_names.to_vec();
    sorted.sort_unstable();
    sorted
        .iter()
        .position(|n| *n == method_name)
        .unwrap_or_else(|| panic!("{method_name} not declared in this interface")) as u16
}

/// A mutable dictionary of typed routing properties, read by routing
/// strategies (spec §3). Backed by JSON values so embedders can stash
/// arbitrary routing-relevant state (e.g. a `GridCoord`) without this
/// crate needing to know its shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingContext {
    properties: HashMap<String, serde_json::Value>,
}

impl RoutingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a property. Setting the same value twice is a no-op observable
    /// via equality of subsequent routing decisions (spec §8).
    pub fn set(&mut self, key: impl Into<String>, value: impl Serialize) {
        let value = serde_json::to_value(value).expect("routing context value must serialize");
        self.properties.insert(key.into(), value);
    }

    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.properties
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_context_set_is_idempotent_observably() {
        let mut a = RoutingContext::new();
        a.set("zone", "0,0");
        a.set("zone", "0,0");
        let mut b = RoutingContext::new();
        b.set("zone", "0,0");
        assert_eq!(a, b);
    }

    #[test]
    fn server_descriptor_zone_from_metadata() {
        let d = ServerDescriptor::new("s1", "127.0.0.1", 40000).with_metadata("zone", "1,0");
        assert_eq!(d.zone(), Some("1,0"));
    }

    #[test]
    fn manifest_name_lookup_roundtrips() {
        let mut m = Manifest::default();
        m.interfaces
            .entry(7)
            .or_default()
            .insert(0, "echo".to_string());
        assert_eq!(m.method_name(7, 0), Some("echo"));
        assert_eq!(m.method_index(7, "echo"), Some(0));
        assert_eq!(m.method_index(7, "missing"), None);
    }

    #[test]
    fn derive_method_indices_sorts_ordinally() {
        let indices = derive_method_indices(&["echo", "add", "stream_count"]);
        assert_eq!(indices.get("add"), Some(&0));
        assert_eq!(indices.get("echo"), Some(&1));
        assert_eq!(indices.get("stream_count"), Some(&2));
    }

    #[test]
    fn method_index_of_matches_derive_method_indices() {
        let names = ["echo", "add", "stream_count"];
        let derived = derive_method_indices(&names);
        for name in names {
            assert_eq!(Some(method_index_of(&names, name)), derived.get(name).copied());
        }
    }

    #[test]
    fn register_interface_uses_derived_indices() {
        let mut m = Manifest::default();
        m.register_interface(7, &["echo", "add"]);
        assert_eq!(m.method_index(7, "add"), Some(0));
        assert_eq!(m.method_index(7, "echo"), Some(1));
    }
}

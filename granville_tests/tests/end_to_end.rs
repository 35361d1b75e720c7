mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use granville_client::GrainRef;
use granville_server::demo::EchoGrain;
use granville_shared::config::RpcConfig;
use granville_shared::errors::RpcError;
use granville_shared::model::{method_index_of, GrainId, GrainKey, Invocation, InvocationOptions, Manifest};
use granville_transport::{Connection, DatagramTransport, UdpTransport};
use uuid::Uuid;

/// Mirrors the demo grain's own method names (spec §4.4: indices are derived
/// by sorting, not hand-assigned, so tests derive them the same way).
const METHOD_NAMES: &[&str] = &["echo", "add", "stream_count"];

async fn connect(addr: SocketAddr) -> Arc<Connection> {
    let transport = UdpTransport::default();
    let cfg = RpcConfig::default();
    let session = transport.connect(addr, cfg.connect_timeout()).await.unwrap();
    Arc::new(
        Connection::connect_as_client(session, Uuid::new_v4(), Manifest::default(), &cfg)
            .await
            .unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_echo_round_trip() {
    let (addr, _server, _handle) = common::start_server(Arc::new(EchoGrain::default())).await;
    let connection = connect(addr).await;

    let grain_ref = GrainRef::new(connection, GrainId::new(1, GrainKey::String("demo".into())), 1);
    let args = serde_json::to_vec(&"hello".to_string()).unwrap();
    let reply = grain_ref
        .invoke(method_index_of(METHOD_NAMES, "echo"), args, InvocationOptions::default())
        .await
        .unwrap();
    let decoded: String = serde_json::from_slice(&reply).unwrap();
    assert_eq!(decoded, "hello");
}

/// A call that fails (unknown grain) must not disturb other in-flight or
/// subsequent calls on the same connection (spec §7: GrainUnknown is
/// call-local).
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_failed_call_does_not_affect_later_calls_on_the_same_connection() {
    let (addr, _server, _handle) = common::start_server(Arc::new(EchoGrain::default())).await;
    let connection = connect(addr).await;

    let bad = Invocation {
        grain_id: GrainId::new(99, GrainKey::String("nope".into())),
        interface_id: 99,
        method_index: 0,
        arguments: Vec::new(),
        options: InvocationOptions::default(),
    };
    let err = connection.call(bad).await.unwrap_err();
    assert!(matches!(err, RpcError::GrainUnknown));

    let good = Invocation {
        grain_id: GrainId::new(1, GrainKey::String("demo".into())),
        interface_id: 1,
        method_index: method_index_of(METHOD_NAMES, "echo"),
        arguments: serde_json::to_vec(&"still alive".to_string()).unwrap(),
        options: InvocationOptions::default(),
    };
    let reply = connection.call(good).await.unwrap();
    let decoded: String = serde_json::from_slice(&reply).unwrap();
    assert_eq!(decoded, "still alive");
}

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use granville_server::dispatcher::ActivationDispatcher;
use granville_shared::config::RpcConfig;
use granville_shared::errors::RpcError;
use granville_shared::model::{GrainId, GrainKey, Invocation, InvocationOptions, Manifest};
use granville_transport::{Connection, DatagramTransport, UdpTransport};
use uuid::Uuid;

struct SlowGrain;

#[async_trait]
impl ActivationDispatcher for SlowGrain {
    async fn resolve_activation(&self, _grain_id: &GrainId) -> bool {
        true
    }

    async fn dispatch(
        &self,
        _grain_id: &GrainId,
        _interface_id: u32,
        _method_index: u16,
        _arguments: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(Vec::new())
    }

    fn manifest(&self) -> Manifest {
        Manifest::default()
    }
}

/// Per spec §8: a call whose deadline passes resolves `Timeout` locally
/// within roughly its deadline window, independent of how long the peer's
/// dispatch actually takes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_call_past_its_deadline_resolves_timeout_within_tolerance() {
    let (addr, _server, _handle) = common::start_server(Arc::new(SlowGrain)).await;

    let transport = UdpTransport::default();
    let cfg = RpcConfig::default();
    let session = transport.connect(addr, cfg.connect_timeout()).await.unwrap();
    let connection = Connection::connect_as_client(session, Uuid::new_v4(), Manifest::default(), &cfg)
        .await
        .unwrap();

    let invocation = Invocation {
        grain_id: GrainId::new(1, GrainKey::String("demo".into())),
        interface_id: 1,
        method_index: 0,
        arguments: Vec::new(),
        options: InvocationOptions {
            deadline_ms: 200,
            ..Default::default()
        },
    };

    let started = Instant::now();
    let err = connection.call(invocation).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RpcError::Timeout));
    assert!(elapsed >= Duration::from_millis(180), "fired too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(220), "fired too late: {elapsed:?}");

    // The timed-out call's own deadline firing must not tear the connection
    // down — a later call still goes through (spec §8: "subsequent calls on
    // the same Connection still succeed, no session teardown").
    let follow_up = Invocation {
        grain_id: GrainId::new(1, GrainKey::String("demo".into())),
        interface_id: 1,
        method_index: 0,
        arguments: Vec::new(),
        options: InvocationOptions {
            deadline_ms: 5_000,
            ..Default::default()
        },
    };
    let reply = connection.call(follow_up).await.unwrap();
    assert!(reply.is_empty());
}

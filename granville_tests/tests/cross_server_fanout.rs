mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use granville_client::CrossServerClient;
use granville_server::demo::EchoGrain;
use granville_server::dispatcher::ActivationDispatcher;
use granville_shared::config::RpcConfig;
use granville_shared::errors::RpcError;
use granville_shared::model::{GrainId, GrainKey, Invocation, InvocationOptions, Manifest};

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

/// Per spec §8: fanning a notification out to several servers, one of which
/// is wedged, still delivers to the healthy ones and reports the slow one
/// as a failure rather than failing the whole fan-out.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_out_tolerates_one_slow_peer() {
    let (addr_b, _server_b, _handle_b) = common::start_server(Arc::new(EchoGrain::default())).await;
    let (addr_c, _server_c, _handle_c) = common::start_server(Arc::new(EchoGrain::default())).await;
    let (addr_d, _server_d, _handle_d) = common::start_server(Arc::new(EchoGrain::default())).await;
    let (addr_e, _server_e, _handle_e) = common::start_server(Arc::new(SlowGrain)).await;

    let mut cfg = RpcConfig::default();
    cfg.cross_server_fanout_timeout_ms = 150;

    let client = CrossServerClient::spawn(cfg, Manifest::default());

    let targets: Vec<String> = [addr_b, addr_c, addr_d, addr_e]
        .iter()
        .map(|a| a.to_string())
        .collect();

    let results = client
        .fan_out(&targets, || Invocation {
            grain_id: GrainId::new(1, GrainKey::String("demo".into())),
            interface_id: 1,
            method_index: 0,
            arguments: serde_json::to_vec(&"ping".to_string()).unwrap(),
            options: InvocationOptions::default(),
        })
        .await;

    assert_eq!(results.len(), 4);
    let ok_count = results.iter().filter(|r| r.result.is_ok()).count();
    assert_eq!(ok_count, 3, "B, C, D should all have succeeded");

    let slow_target = addr_e.to_string();
    let slow_result = results.iter().find(|r| r.target == slow_target).unwrap();
    assert!(
        matches!(slow_result.result, Err(RpcError::Timeout)),
        "E should be recorded as a timed-out failure, got {:?}",
        slow_result.result
    );
}

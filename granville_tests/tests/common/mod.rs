use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use granville_server::RpcServer;
use granville_server::dispatcher::ActivationDispatcher;
use granville_shared::config::RpcConfig;

/// Binds a server on an ephemeral port and returns its resolved address once
/// the listener is up, plus the background task driving it.
pub async fn start_server<D: ActivationDispatcher + 'static>(
    dispatcher: Arc<D>,
) -> (SocketAddr, Arc<RpcServer>, tokio::task::JoinHandle<()>) {
    start_server_with_cfg(dispatcher, RpcConfig::default()).await
}

pub async fn start_server_with_cfg<D: ActivationDispatcher + 'static>(
    dispatcher: Arc<D>,
    mut cfg: RpcConfig,
) -> (SocketAddr, Arc<RpcServer>, tokio::task::JoinHandle<()>) {
    cfg.listen_addr = "127.0.0.1:0".to_string();
    let server = Arc::new(RpcServer::new(cfg));
    let server_for_task = server.clone();
    let handle = tokio::spawn(async move {
        let _ = server_for_task.serve(dispatcher).await;
    });
    let addr = loop {
        if let Some(addr) = server.local_addr().await {
            break addr;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    (addr, server, handle)
}

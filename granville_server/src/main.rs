//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p granville_server -- [--addr 0.0.0.0:40000] [--call-timeout-ms 30000]
//!
//! The server listens for UDP sessions, handshakes each one, and dispatches
//! requests against the bundled demo grain.
//!
//! Console commands:
//!   status  - show listen address and cvars
//!   quit    - shut down

use std::env;
use std::io::{BufRead, Write};
use std::sync::Arc;

use granville_server::demo::EchoGrain;
use granville_server::RpcServer;
use granville_shared::config::RpcConfig;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> RpcConfig {
    let mut cfg = RpcConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.listen_addr = args[i + 1].clone();
                i += 2;
            }
            "--call-timeout-ms" if i + 1 < args.len() => {
                cfg.call_timeout_ms = args[i + 1].parse().unwrap_or(cfg.call_timeout_ms);
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args();
    info!(addr = %cfg.listen_addr, "starting granville server");

    let server = Arc::new(RpcServer::new(cfg));
    let dispatcher = Arc::new(EchoGrain::default());

    let serve_task = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(dispatcher).await })
    };

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'status' for info, 'quit' to exit.");

    while let Some(line) = console_rx.recv().await {
        if line == "quit" {
            break;
        }
        if line == "status" {
            let addr = server.local_addr().await;
            println!("listening on {addr:?}");
            if let Some(timeout) = server.console.get_cvar("rpc_call_timeout_ms") {
                println!("rpc_call_timeout_ms = {timeout}");
            }
            continue;
        }
        println!("unknown command: {line}");
    }

    serve_task.abort();
    Ok(())
}

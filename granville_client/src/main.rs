//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p granville_client -- [--addr 127.0.0.1:40000] [--zone 0,0]
//!
//! Registers one server with the multiplexer, resolves it through zone
//! routing, and drives the bundled demo grain's `echo`/`add` methods from a
//! console loop.
//!
//! Console commands:
//!   echo <text>   - call echo(text) on the demo grain
//!   add <a> <b>   - call add(a, b) on the demo grain
//!   zone <value>  - update the routing context's zone (next call re-routes)
//!   status        - show registered servers
//!   quit          - exit

use std::env;
use std::io::{BufRead, Write};
use std::sync::Arc;

use granville_client::define_grain_interface;
use granville_client::routing::ZoneRoutingStrategy;
use granville_client::{ClientMultiplexer, SharedRoutingContext};
use granville_shared::config::RpcConfig;
use granville_shared::model::{GrainId, GrainKey, Manifest, RoutingContext, ServerDescriptor};
use tokio::sync::mpsc;
use tracing::info;

define_grain_interface! {
    pub trait EchoInterface : 1 {
        fn echo(&self, text: String) -> String;
        fn add(&self, a: i64, b: i64) -> i64;
    }
}

struct Args {
    addr: String,
    zone: String,
}

fn parse_args() -> Args {
    let mut args = Args {
        addr: "127.0.0.1:40000".to_string(),
        zone: "0,0".to_string(),
    };
    let raw: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < raw.len() {
        match raw[i].as_str() {
            "--addr" if i + 1 < raw.len() => {
                args.addr = raw[i + 1].clone();
                i += 2;
            }
            "--zone" if i + 1 < raw.len() => {
                args.zone = raw[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    args
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    info!(addr = %args.addr, zone = %args.zone, "starting granville client");

    let (host, port) = args
        .addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("--addr must be host:port"))?;
    let port: u16 = port.parse()?;

    let mux = ClientMultiplexer::spawn(
        RpcConfig::default(),
        Manifest::default(),
        Arc::new(ZoneRoutingStrategy),
    );
    mux.register(
        ServerDescriptor::new("default", host, port)
            .with_metadata("zone", args.zone.clone())
            .with_primary(true),
    )
    .await;

    let mut initial_context = RoutingContext::new();
    initial_context.set("zone", &args.zone);
    let routing_context = SharedRoutingContext::new(initial_context);

    let echo = EchoInterface::new(mux.get_grain(
        routing_context.clone(),
        GrainId::new(1, GrainKey::String("demo".to_string())),
        1,
    ));

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

    println!("Client ready. Type 'echo <text>', 'add <a> <b>', 'zone <value>', 'status', or 'quit'.");

    while let Some(line) = console_rx.recv().await {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("quit") => break,
            Some("status") => {
                for descriptor in mux.descriptors().await {
                    println!("{} -> {} ({:?})", descriptor.server_id, descriptor.addr(), descriptor.health);
                }
            }
            Some("echo") => {
                let text = parts.collect::<Vec<_>>().join(" ");
                match echo.echo(text).await {
                    Ok(reply) => println!("{reply}"),
                    Err(e) => println!("error: {e}"),
                }
            }
            Some("add") => {
                let nums: Vec<i64> = parts.filter_map(|p| p.parse().ok()).collect();
                if nums.len() != 2 {
                    println!("usage: add <a> <b>");
                    continue;
                }
                match echo.add(nums[0], nums[1]).await {
                    Ok(sum) => println!("{sum}"),
                    Err(e) => println!("error: {e}"),
                }
            }
            Some("zone") => {
                let Some(value) = parts.next() else {
                    println!("usage: zone <value>");
                    continue;
                };
                let value = value.to_string();
                routing_context.update(|ctx| ctx.set("zone", &value));
                println!("routing context zone set to {value}; next call re-routes");
            }
            _ => println!("unknown command: {line}"),
        }
    }

    Ok(())
}

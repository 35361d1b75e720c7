mod common;

use std::sync::Arc;

use granville_client::{define_grain_interface, ClientMultiplexer, SharedRoutingContext, ZoneRoutingStrategy};
use granville_server::demo::EchoGrain;
use granville_shared::config::RpcConfig;
use granville_shared::model::{GrainId, GrainKey, Manifest, RoutingContext, ServerDescriptor, ServerHealth};

// Declares the same method set as the demo grain's interface (spec §4.4:
// both sides derive indices by sorting the full set, so a partial
// declaration here would disagree with the server's numbering).
define_grain_interface! {
    pub trait EchoInterface : 1 {
        fn echo(&self, text: String) -> String;
        fn add(&self, a: i64, b: i64) -> i64;
    }
}

/// Registers two servers under distinct zones and confirms that updating a
/// routing context changes where the **next call on the same reference**
/// lands, rather than requiring the reference to be rebuilt (spec §8 "zone
/// handoff": resolution happens at call time).
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn the_same_reference_hands_off_when_its_routing_context_changes() {
    let (addr_a, _server_a, _handle_a) = common::start_server(Arc::new(EchoGrain::default())).await;
    let (addr_b, _server_b, _handle_b) = common::start_server(Arc::new(EchoGrain::default())).await;

    let mux = ClientMultiplexer::spawn(
        RpcConfig::default(),
        Manifest::default(),
        Arc::new(ZoneRoutingStrategy),
    );
    mux.register(
        ServerDescriptor::new("a", addr_a.ip().to_string(), addr_a.port())
            .with_metadata("zone", "0,0")
            .with_health(ServerHealth::Healthy),
    )
    .await;
    mux.register(
        ServerDescriptor::new("b", addr_b.ip().to_string(), addr_b.port())
            .with_metadata("zone", "1,0")
            .with_health(ServerHealth::Healthy),
    )
    .await;

    let mut initial = RoutingContext::new();
    initial.set("zone", "0,0");
    let context = SharedRoutingContext::new(initial);

    let echo = EchoInterface::new(mux.get_grain(
        context.clone(),
        GrainId::new(1, GrainKey::String("demo".to_string())),
        1,
    ));

    // Same reference, first call resolves through zone "0,0" -> server a.
    let reply = echo.echo("hi".to_string()).await.unwrap();
    assert_eq!(reply, "hi");
    let connection = mux.route(context.snapshot()).await.unwrap();
    assert_eq!(connection.remote_addr(), addr_a);

    // Mutate the context; the *next call on the same `echo` reference*
    // must observe the change without constructing anything new.
    context.update(|ctx| ctx.set("zone", "1,0"));
    let reply = echo.echo("hi".to_string()).await.unwrap();
    assert_eq!(reply, "hi");
    let connection = mux.route(context.snapshot()).await.unwrap();
    assert_eq!(connection.remote_addr(), addr_b);
}

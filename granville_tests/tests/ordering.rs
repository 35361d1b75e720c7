use granville_shared::config::RpcConfig;
use granville_shared::model::{DeliveryMode, GrainId, GrainKey, Invocation, InvocationOptions, Manifest};
use granville_transport::{Connection, ConnectionEvent, DatagramTransport, UdpTransport};
use uuid::Uuid;

/// Per spec §4.2/§8: `ReliableOrdered` datagrams are delivered to the
/// connection in the order they were submitted, even though the underlying
/// transport doesn't guarantee in-order arrival on the wire. Exercised at
/// the `Connection` level (not through the invocation engine, which
/// deliberately dispatches concurrently and so doesn't preserve completion
/// order).
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reliable_ordered_requests_are_delivered_in_submission_order() {
    let cfg = RpcConfig::default();
    let transport = UdpTransport::default();
    let listener = transport.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr();

    let server_task = tokio::spawn(async move {
        let session = listener.accept().await.unwrap();
        Connection::accept_as_server(session, Uuid::new_v4(), Manifest::default(), &RpcConfig::default())
            .await
            .unwrap()
    });

    let client_session = transport.connect(addr, cfg.connect_timeout()).await.unwrap();
    let client = Connection::connect_as_client(client_session, Uuid::new_v4(), Manifest::default(), &cfg)
        .await
        .unwrap();
    let server_connection = server_task.await.unwrap();

    for i in 0..100u32 {
        let invocation = Invocation {
            grain_id: GrainId::new(1, GrainKey::String("demo".into())),
            interface_id: 1,
            method_index: 0,
            arguments: serde_json::to_vec(&i).unwrap(),
            options: InvocationOptions {
                delivery_mode: DeliveryMode::ReliableOrdered,
                one_way: true,
                ..Default::default()
            },
        };
        client.call_one_way(invocation).await.unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 100 {
        match server_connection.next_event().await {
            Some(ConnectionEvent::Invocation { arguments, .. }) => {
                let value: u32 = serde_json::from_slice(&arguments).unwrap();
                received.push(value);
            }
            Some(_) => continue,
            None => break,
        }
    }

    assert_eq!(received, (0..100u32).collect::<Vec<_>>());
}

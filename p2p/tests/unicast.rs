//! Stream reset discipline under load.
//!
//! Every inbound stream must end in the `Reset` state, whether it was read
//! successfully, timed out, or carried bytes the handler refused.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use pocket_p2p::host::{send_to_peer, AddrInfo, Host, MemoryNetwork, Stream, StreamState};
use pocket_p2p::router::{UnicastRouter, UnicastRouterConfig};
use pocket_p2p::{P2pError, P2pMetrics};

const PROTOCOL: &str = "/pokt/stress/v1.0.0";

#[tokio::test]
async fn every_stream_ends_reset() {
    init_tracing();
    let network = MemoryNetwork::new();
    let nodes = spawn_nodes(&network, 2);
    let (sender, receiver) = (&nodes[0], &nodes[1]);
    sender
        .host
        .connect(AddrInfo {
            peer_id: receiver.key.peer_id(),
            addrs: receiver.host.listen_addrs(),
        })
        .await
        .expect("connects");

    let (tx, mut inbox) = tokio::sync::mpsc::unbounded_channel();
    let metrics = Arc::new(P2pMetrics::unregistered().expect("fresh registry"));
    let router = UnicastRouter::new(UnicastRouterConfig {
        host: receiver.host.clone(),
        protocol: PROTOCOL.into(),
        read_timeout: Duration::from_millis(200),
        client_debug_mode: false,
        message_handler: Arc::new(move |data: Vec<u8>| {
            if data.starts_with(b"bad") {
                return Err(P2pError::Handler("refused".into()));
            }
            let _ = tx.send(data);
            Ok(())
        }),
        peer_handler: Arc::new(|_| Ok(())),
        metrics: Arc::clone(&metrics),
    });
    router.start().expect("handler registers");

    let mut sends = Vec::new();
    for i in 0..32u8 {
        let host = sender.host.clone();
        let peer = receiver.key.peer_id();
        sends.push(tokio::spawn(async move {
            let body = if i % 4 == 0 { b"bad".to_vec() } else { vec![i] };
            send_to_peer(host.as_ref(), peer, PROTOCOL, &body).await
        }));
    }
    for send in sends {
        send.await.expect("task joins").expect("send succeeds");
    }

    // One writer that never finishes, so its read ends by deadline.
    let mut stalled = sender
        .host
        .new_stream(receiver.key.peer_id(), PROTOCOL)
        .await
        .expect("stream opens");
    stalled.write_all(b"partial").await.expect("write succeeds");

    let all_reset = eventually(Duration::from_secs(2), || async {
        let probes = network.inbound_streams();
        probes.len() == 33 && probes.iter().all(|p| p.state() == StreamState::Reset)
    })
    .await;
    assert!(all_reset, "streams left open: {:?}", network.inbound_streams());

    let delivered = collect_for(&mut inbox, Duration::from_millis(50)).await;
    assert_eq!(delivered.len(), 24);
    assert_eq!(metrics.unicast_streams_total.get(), 33);
    assert_eq!(metrics.unicast_stream_errors_total.get(), 1);
}

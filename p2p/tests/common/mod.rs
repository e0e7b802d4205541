//! Shared fixtures for the integration tests.
//!
//! Everything here runs over an in-process `MemoryNetwork`, so the tests
//! exercise the real routers and stream discipline without sockets.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use tokio::sync::mpsc;

use pocket_p2p::codec::{PocketEnvelope, DEBUG_TYPE_URL};
use pocket_p2p::host::{MemoryHost, MemoryNetwork};
use pocket_p2p::providers::{AtomicHeight, StakedPeerstoreProvider, StaticPeerstoreProvider};
use pocket_p2p::router::{MessageHandler, RainTreeRouter, RainTreeRouterConfig};
use pocket_p2p::{P2pMetrics, Peer, Peerstore, PrivateKey};

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

static TRACING: Once = Once::new();

/// Routes `tracing` output to the test harness. Honours `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A key plus the memory host it owns.
pub struct TestNode {
    pub key: PrivateKey,
    pub host: Arc<MemoryHost>,
}

impl TestNode {
    /// The peer other nodes should know this node as.
    pub fn peer(&self) -> Peer {
        Peer::from_multiaddr(self.key.public_key(), self.host.listen_addr().clone())
            .expect("memory listen address is a valid peer address")
    }

    /// `listen address + /p2p/<id>`, usable as a bootstrap entry.
    pub fn bootstrap_addr(&self) -> Multiaddr {
        self.host
            .listen_addr()
            .clone()
            .with(Protocol::P2p(self.key.peer_id()))
    }
}

/// Creates `n` hosts on `network`.
pub fn spawn_nodes(network: &MemoryNetwork, n: usize) -> Vec<TestNode> {
    (0..n)
        .map(|_| {
            let key = PrivateKey::generate();
            let host = network.add_host(&key);
            TestNode { key, host }
        })
        .collect()
}

/// Peerstore holding every node.
pub fn peerstore_of(nodes: &[TestNode]) -> Peerstore {
    nodes.iter().map(TestNode::peer).collect()
}

/// Provider returning `peerstore` at every height.
pub fn static_provider(peerstore: Peerstore) -> Arc<dyn StakedPeerstoreProvider> {
    Arc::new(StaticPeerstoreProvider::new(peerstore))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// A message handler that forwards every payload to the returned receiver.
pub fn collecting_handler() -> (MessageHandler, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: MessageHandler = Arc::new(move |data| {
        let _ = tx.send(data);
        Ok(())
    });
    (handler, rx)
}

/// A RainTree router together with what it delivered and its metrics.
pub struct RainTreeNode {
    pub router: Arc<RainTreeRouter>,
    pub inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    pub metrics: Arc<P2pMetrics>,
}

/// Starts a RainTree router for `node`.
pub async fn raintree_node(
    node: &TestNode,
    provider: Arc<dyn StakedPeerstoreProvider>,
) -> RainTreeNode {
    let (handler, inbox) = collecting_handler();
    let metrics = Arc::new(P2pMetrics::unregistered().expect("fresh registry"));
    let router = RainTreeRouter::new(RainTreeRouterConfig {
        host: node.host.clone(),
        address: node.key.address(),
        provider,
        height_provider: Arc::new(AtomicHeight::new(1)),
        handler,
        max_nonces: 1024,
        read_timeout: Duration::from_secs(2),
        client_debug_mode: false,
        metrics: Arc::clone(&metrics),
    })
    .await
    .expect("raintree router starts");
    RainTreeNode {
        router,
        inbox,
        metrics,
    }
}

// ---------------------------------------------------------------------------
// Waiting
// ---------------------------------------------------------------------------

/// Everything that arrives on `rx` within `window`.
pub async fn collect_for<T>(rx: &mut mpsc::UnboundedReceiver<T>, window: Duration) -> Vec<T> {
    let mut items = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(item)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        items.push(item);
    }
    items
}

/// Polls `check` until it holds or `timeout` passes. Returns the last result.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// An encoded debug envelope carrying `body`.
pub fn envelope_bytes(body: &[u8]) -> Vec<u8> {
    PocketEnvelope::new(DEBUG_TYPE_URL, body.to_vec())
        .encode()
        .expect("envelope encodes")
}

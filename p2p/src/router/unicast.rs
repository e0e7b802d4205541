//! # Unicast Router
//!
//! Inbound half of every stream protocol. For each accepted stream:
//!
//! 1. build a [`Peer`](crate::peer::Peer) from the connection,
//! 2. hand it to the owner's peer handler,
//! 3. on a fresh task: read to EOF under a deadline, **reset**, then pass the
//!    bytes to the owner's message handler.
//!
//! The reset in step 3 happens on success and on failure alike. Streams that
//! are left half-open count against the transport's connection limits.
//!
//! The outbound half is [`send_to_peer`]: open, write, close.

use libp2p::PeerId;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::{MessageHandler, PeerHandler};
use crate::config::MAX_FRAME_SIZE;
use crate::error::P2pError;
use crate::host::{peer_from_stream, send_to_peer, Host, HostError, Stream, StreamHandler};
use crate::telemetry::P2pMetrics;

/// Largest stream body accepted: one frame plus its length prefix.
const READ_LIMIT: usize = MAX_FRAME_SIZE + 4;

/// Construction parameters for [`UnicastRouter`].
pub struct UnicastRouterConfig {
    /// Transport.
    pub host: Arc<dyn Host>,
    /// Protocol ID whose inbound streams this router accepts.
    pub protocol: String,
    /// Deadline for reading one stream.
    pub read_timeout: Duration,
    /// When set, no inbound handler is registered.
    pub client_debug_mode: bool,
    /// Receives each stream's bytes.
    pub message_handler: MessageHandler,
    /// Receives each stream's sender before it is read.
    pub peer_handler: PeerHandler,
    /// Metrics sink.
    pub metrics: Arc<P2pMetrics>,
}

/// Inbound stream handling for one protocol ID.
pub struct UnicastRouter {
    host: Arc<dyn Host>,
    protocol: String,
    read_timeout: Duration,
    client_debug_mode: bool,
    message_handler: MessageHandler,
    peer_handler: PeerHandler,
    metrics: Arc<P2pMetrics>,
    shutdown: watch::Sender<bool>,
}

impl UnicastRouter {
    /// Creates the router. Nothing is accepted until [`start`](Self::start).
    pub fn new(config: UnicastRouterConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            host: config.host,
            protocol: config.protocol,
            read_timeout: config.read_timeout,
            client_debug_mode: config.client_debug_mode,
            message_handler: config.message_handler,
            peer_handler: config.peer_handler,
            metrics: config.metrics,
            shutdown,
        })
    }

    /// Registers the stream handler, unless in client debug mode.
    pub fn start(self: &Arc<Self>) -> Result<(), P2pError> {
        if self.client_debug_mode {
            info!(protocol = %self.protocol, "client debug mode, not accepting inbound streams");
            return Ok(());
        }
        self.host
            .set_stream_handler(&self.protocol, stream_handler(Arc::downgrade(self)))?;
        debug!(protocol = %self.protocol, "stream handler registered");
        Ok(())
    }

    /// Protocol ID served by this router.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Processes one accepted stream. Returns immediately; the read runs on
    /// its own task.
    pub fn handle_stream(&self, mut stream: Box<dyn Stream>) {
        self.metrics.unicast_streams_total.inc();

        let peer = match peer_from_stream(self.host.as_ref(), stream.as_ref()) {
            Ok(peer) => peer,
            Err(e) => {
                debug!(
                    peer_id = %stream.remote_peer(),
                    protocol = %self.protocol,
                    error = %e,
                    "cannot build peer from stream"
                );
                self.metrics.unicast_stream_errors_total.inc();
                stream.reset();
                return;
            }
        };

        if let Err(e) = (self.peer_handler)(&peer) {
            debug!(address = %peer.address(), error = %e, "peer handler refused stream");
            self.metrics.unicast_stream_errors_total.inc();
            stream.reset();
            return;
        }

        let deadline = Instant::now() + self.read_timeout;
        let message_handler = Arc::clone(&self.message_handler);
        let metrics = Arc::clone(&self.metrics);
        let mut shutdown = self.shutdown.subscribe();
        let address = peer.address();

        tokio::spawn(async move {
            stream.set_read_deadline(deadline);
            let result = tokio::select! {
                result = stream.read_to_end(READ_LIMIT) => result,
                _ = shutdown.changed() => Err(HostError::Closed),
            };
            stream.reset();

            match result {
                Ok(data) => {
                    trace!(address = %address, bytes = data.len(), "stream read");
                    if let Err(e) = message_handler(data) {
                        debug!(address = %address, error = %e, "handling stream data failed");
                    }
                }
                Err(e) => {
                    metrics.unicast_stream_errors_total.inc();
                    debug!(address = %address, error = %e, "reading stream failed");
                }
            }
        });
    }

    /// Opens a stream on this router's protocol and writes `data` to it.
    pub async fn send(&self, peer_id: PeerId, data: &[u8]) -> Result<(), HostError> {
        send_to_peer(self.host.as_ref(), peer_id, &self.protocol, data).await
    }

    /// Stops accepting streams and aborts in-flight reads (which reset).
    pub fn close(&self) {
        self.host.remove_stream_handler(&self.protocol);
        self.shutdown.send_replace(true);
    }
}

impl Drop for UnicastRouter {
    fn drop(&mut self) {
        self.host.remove_stream_handler(&self.protocol);
    }
}

fn stream_handler(router: Weak<UnicastRouter>) -> StreamHandler {
    Arc::new(move |mut stream: Box<dyn Stream>| match router.upgrade() {
        Some(router) => router.handle_stream(stream),
        None => stream.reset(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;
    use crate::host::{AddrInfo, MemoryHost, MemoryNetwork, StreamState};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    const PROTOCOL: &str = "/pokt/test/v1.0.0";

    struct Fixture {
        network: MemoryNetwork,
        sender: Arc<MemoryHost>,
        receiver: Arc<MemoryHost>,
        inbox: mpsc::UnboundedReceiver<Vec<u8>>,
        seen_peers: Arc<Mutex<Vec<crate::crypto::Address>>>,
        router: Arc<UnicastRouter>,
    }

    async fn fixture(client_debug_mode: bool, accept_peers: bool) -> Fixture {
        let network = MemoryNetwork::new();
        let sender = network.add_host(&PrivateKey::generate());
        let receiver = network.add_host(&PrivateKey::generate());
        sender
            .connect(AddrInfo {
                peer_id: receiver.id(),
                addrs: receiver.listen_addrs(),
            })
            .await
            .unwrap();

        let (tx, inbox) = mpsc::unbounded_channel();
        let seen_peers = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&seen_peers);
        let host: Arc<dyn Host> = receiver.clone();
        let router = UnicastRouter::new(UnicastRouterConfig {
            host,
            protocol: PROTOCOL.into(),
            read_timeout: Duration::from_millis(200),
            client_debug_mode,
            message_handler: Arc::new(move |data| {
                let _ = tx.send(data);
                Ok(())
            }),
            peer_handler: Arc::new(move |peer| {
                seen.lock().push(peer.address());
                if accept_peers {
                    Ok(())
                } else {
                    Err(P2pError::Handler("not today".into()))
                }
            }),
            metrics: Arc::new(P2pMetrics::unregistered().unwrap()),
        });
        router.start().unwrap();

        Fixture {
            network,
            sender,
            receiver,
            inbox,
            seen_peers,
            router,
        }
    }

    async fn wait_for_reset(network: &MemoryNetwork) {
        for _ in 0..100 {
            let probes = network.inbound_streams();
            if !probes.is_empty() && probes.iter().all(|p| p.state() == StreamState::Reset) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("inbound streams were not reset: {:?}", network.inbound_streams());
    }

    #[tokio::test]
    async fn delivers_bytes_and_resets_stream() {
        let mut fx = fixture(false, true).await;
        send_to_peer(fx.sender.as_ref(), fx.receiver.id(), PROTOCOL, b"payload")
            .await
            .unwrap();

        assert_eq!(fx.inbox.recv().await.unwrap(), b"payload".to_vec());
        wait_for_reset(&fx.network).await;

        let expected = crate::crypto::PublicKey::from_peer_id(&fx.sender.id())
            .unwrap()
            .address();
        assert_eq!(fx.seen_peers.lock().as_slice(), &[expected]);
    }

    #[tokio::test]
    async fn timed_out_stream_is_reset_without_delivery() {
        let mut fx = fixture(false, true).await;
        // Open and write, but never close: the read can only end by deadline.
        let mut stream = fx.sender.new_stream(fx.receiver.id(), PROTOCOL).await.unwrap();
        stream.write_all(b"partial").await.unwrap();

        wait_for_reset(&fx.network).await;
        assert!(fx.inbox.try_recv().is_err());
        assert_eq!(fx.router.metrics.unicast_stream_errors_total.get(), 1);
    }

    #[tokio::test]
    async fn refused_peer_is_reset_before_reading() {
        let mut fx = fixture(false, false).await;
        let _ = send_to_peer(fx.sender.as_ref(), fx.receiver.id(), PROTOCOL, b"x").await;

        wait_for_reset(&fx.network).await;
        assert!(fx.inbox.try_recv().is_err());
        assert_eq!(fx.seen_peers.lock().len(), 1);
    }

    #[tokio::test]
    async fn client_debug_mode_accepts_nothing() {
        let fx = fixture(true, true).await;
        let err = fx
            .sender
            .new_stream(fx.receiver.id(), PROTOCOL)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HostError::ProtocolNotSupported { .. }));
    }

    #[tokio::test]
    async fn close_unregisters_handler() {
        let fx = fixture(false, true).await;
        fx.router.close();
        let err = send_to_peer(fx.sender.as_ref(), fx.receiver.id(), PROTOCOL, b"late")
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::ProtocolNotSupported { .. }));
    }
}

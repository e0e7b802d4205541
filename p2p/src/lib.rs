// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Pocket P2P
//!
//! The peer-to-peer layer of a Pocket proof-of-stake node. It moves opaque
//! `PocketEnvelope` payloads between nodes over two routers that share one
//! libp2p host:
//!
//! - **RainTree** delivers consensus traffic to every staked node with a
//!   bounded number of copies per node, using a deterministic ternary tree
//!   over the sorted staked address list.
//! - **Background** gossips everything else on a pub/sub topic and discovers
//!   unstaked peers through a Kademlia DHT.
//!
//! ## Architecture
//!
//! - **crypto**: Ed25519 keys, 20-byte addresses, nonces.
//! - **peer**: peers, peerstores, service URL ↔ multiaddr.
//! - **codec**: envelopes, router messages, length-prefixed frames.
//! - **dedup**: bounded nonce set with copy counts.
//! - **host**: the transport capability plus in-memory and libp2p hosts.
//! - **router**: unicast stream handling, RainTree, Background.
//! - **providers**: staked peer sets and heights.
//! - **module**: the façade the node drives.
//! - **telemetry**: Prometheus metrics.
//! - **config**: protocol constants and runtime configuration.
//!
//! ## Ground Rules
//!
//! 1. A peer's address always derives from its public key.
//! 2. Every inbound stream is reset once read, whatever the outcome.
//! 3. Nothing is retried below the routers; RainTree's redundancy is the
//!    recovery mechanism.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod dedup;
pub mod error;
pub mod host;
pub mod module;
pub mod peer;
pub mod providers;
pub mod router;
pub mod telemetry;

pub use codec::{EnvelopeRegistry, PocketEnvelope};
pub use config::P2pConfig;
pub use crypto::{Address, PrivateKey, PublicKey};
pub use error::P2pError;
pub use module::{InboundMessage, P2PModule, P2PModuleDeps, P2pEvent, RouterSelector};
pub use peer::{Peer, Peerstore};
pub use router::{Router, RouterKind};
pub use telemetry::P2pMetrics;

pub use libp2p::Multiaddr;

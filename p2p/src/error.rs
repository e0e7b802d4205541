//! Crate-wide error type.
//!
//! Each layer keeps its own error enum; [`P2pError`] is what crosses the
//! module façade and the router trait.

use thiserror::Error;

use crate::codec::CodecError;
use crate::crypto::{Address, KeyError};
use crate::host::HostError;
use crate::peer::{PeerError, PeerstoreError, UrlError};
use crate::providers::ProviderError;

/// Errors surfaced by routers and the P2P module.
#[derive(Debug, Error)]
pub enum P2pError {
    /// Key material problem.
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// A peer could not be built.
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    /// Peerstore rejected an update.
    #[error("peerstore error: {0}")]
    Peerstore(#[from] PeerstoreError),

    /// URL ↔ multiaddr conversion failed.
    #[error("url error: {0}")]
    Url(#[from] UrlError),

    /// A frame or envelope could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] HostError),

    /// A peerstore or height provider failed.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The destination is not in the router's peerstore.
    #[error("peer {0} not found")]
    PeerNotFound(Address),

    /// The operation needs a started module.
    #[error("p2p module not started")]
    NotStarted,

    /// `start` was called twice.
    #[error("p2p module already started")]
    AlreadyStarted,

    /// The inbound handler refused a message.
    #[error("message handler failed: {0}")]
    Handler(String),

    /// Configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

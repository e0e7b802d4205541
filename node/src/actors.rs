//! # Staked Actors File
//!
//! A [`StakedPeerstoreProvider`] backed by a JSON file listing the staked
//! actors. The file is re-read whenever a new height is queried, so edits
//! take effect at the next committed height. Repeated queries for the same
//! height return the same set, and each service URL is resolved only once.
//!
//! ```json
//! [
//!   {
//!     "address": "6f1e...c2",
//!     "public_key": "9a3b...07",
//!     "service_url": "node1.pokt.network:42069"
//!   }
//! ]
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pocket_p2p::peer::{Resolver, SystemResolver};
use pocket_p2p::providers::{
    ActorRecord, ProviderError, ResolvedPeerCache, StakedPeerstoreProvider,
};
use pocket_p2p::Peerstore;

/// Reads the staked set from a JSON actors file.
pub struct ActorsFileProvider {
    path: PathBuf,
    resolver: Arc<dyn Resolver>,
    resolved: ResolvedPeerCache,
    /// Answer for the most recently queried height.
    last: Mutex<Option<(u64, Peerstore)>>,
}

impl ActorsFileProvider {
    /// Resolves service URLs through the operating system.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_resolver(path, Arc::new(SystemResolver))
    }

    /// Uses `resolver` for service URLs.
    pub fn with_resolver(path: impl Into<PathBuf>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            path: path.into(),
            resolver,
            resolved: ResolvedPeerCache::new(),
            last: Mutex::new(None),
        }
    }

    /// Path of the actors file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_actors(&self) -> Result<Vec<ActorRecord>, ProviderError> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| {
            ProviderError::Backend(format!("reading {}: {e}", self.path.display()))
        })?;
        serde_json::from_slice(&raw).map_err(|e| {
            ProviderError::Backend(format!("parsing {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl StakedPeerstoreProvider for ActorsFileProvider {
    async fn staked_peerstore_at_height(&self, height: u64) -> Result<Peerstore, ProviderError> {
        let memoized = match &*self.last.lock() {
            Some((at, peerstore)) if *at == height => Some(peerstore.clone()),
            _ => None,
        };
        if let Some(peerstore) = memoized {
            return Ok(peerstore);
        }

        let actors = self.read_actors().await?;
        let peerstore = self
            .resolved
            .actors_to_peerstore(&actors, self.resolver.as_ref())
            .await?;
        *self.last.lock() = Some((height, peerstore.clone()));
        tracing::debug!(
            height,
            actors = actors.len(),
            path = %self.path.display(),
            "loaded staked actors"
        );
        Ok(peerstore)
    }
}

//! # HTTP API
//!
//! Builds the axum router that exposes the node's HTTP interface. All
//! endpoints share application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path      | Description                                   |
//! |--------|-----------|-----------------------------------------------|
//! | GET    | `/health` | Liveness probe                                |
//! | GET    | `/status` | Identity, height and peerstore sizes          |
//! | GET    | `/peers`  | Known peers; `?selector=staked\|unstaked\|all` |

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use pocket_p2p::host::Host;
use pocket_p2p::providers::{AtomicHeight, CurrentHeightProvider};
use pocket_p2p::{P2PModule, P2pError, Peer, RouterSelector};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The node's reported version string.
    pub version: String,
    /// The running P2P module.
    pub p2p: Arc<P2PModule>,
    /// Latest committed height.
    pub heights: Arc<AtomicHeight>,
}

/// Builds the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/peers", get(peers_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// Node status summary.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub address: String,
    pub peer_id: String,
    pub height: u64,
    pub started: bool,
    /// `None` while the module is stopped.
    pub staked_peers: Option<usize>,
    pub unstaked_peers: Option<usize>,
}

/// One peer as reported by `/peers`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PeerResponse {
    pub address: String,
    pub public_key: String,
    pub service_url: String,
    pub multiaddr: String,
}

impl From<&Peer> for PeerResponse {
    fn from(peer: &Peer) -> Self {
        Self {
            address: peer.address().to_hex(),
            public_key: peer.public_key().to_hex(),
            service_url: peer.service_url().to_string(),
            multiaddr: peer.multiaddr().to_string(),
        }
    }
}

/// Error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// `?selector=` values accepted by `/peers`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorParam {
    Staked,
    Unstaked,
    #[default]
    All,
}

impl From<SelectorParam> for RouterSelector {
    fn from(param: SelectorParam) -> Self {
        match param {
            SelectorParam::Staked => RouterSelector::Staked,
            SelectorParam::Unstaked => RouterSelector::Unstaked,
            SelectorParam::All => RouterSelector::All,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PeersQuery {
    #[serde(default)]
    pub selector: SelectorParam,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let count = |selector| state.p2p.peer_list(selector).ok().map(|peers| peers.len());
    Json(StatusResponse {
        version: state.version.clone(),
        address: state.p2p.address().to_hex(),
        peer_id: state.p2p.host().id().to_string(),
        height: state.heights.current_height(),
        started: state.p2p.is_started(),
        staked_peers: count(RouterSelector::Staked),
        unstaked_peers: count(RouterSelector::Unstaked),
    })
}

async fn peers_handler(
    State(state): State<AppState>,
    Query(query): Query<PeersQuery>,
) -> impl IntoResponse {
    match state.p2p.peer_list(query.selector.into()) {
        Ok(peers) => {
            let body: Vec<PeerResponse> = peers.iter().map(PeerResponse::from).collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(P2pError::NotStarted) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "p2p module not started".into(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use pocket_p2p::host::MemoryNetwork;
    use pocket_p2p::providers::StaticPeerstoreProvider;
    use pocket_p2p::{
        EnvelopeRegistry, P2PModuleDeps, P2pConfig, P2pMetrics, Peerstore, PrivateKey,
    };

    /// A module on an in-memory network whose staked set is itself plus
    /// one other node.
    fn test_state(network: &MemoryNetwork) -> AppState {
        let key = PrivateKey::generate();
        let other = PrivateKey::generate();
        let host = network.add_host(&key);
        let other_host = network.add_host(&other);

        let mut staked = Peerstore::new();
        for (k, addr) in [(&key, host.listen_addr()), (&other, other_host.listen_addr())] {
            staked
                .add_peer(Peer::from_multiaddr(k.public_key(), addr.clone()).expect("valid peer"))
                .expect("unique");
        }

        let heights = Arc::new(AtomicHeight::new(7));
        let config = P2pConfig {
            private_key: Some(key.to_hex()),
            ..P2pConfig::default()
        };
        let (module, _inbox) = P2PModule::new(
            config,
            P2PModuleDeps {
                host,
                provider: Arc::new(StaticPeerstoreProvider::new(staked)),
                heights: heights.clone(),
                registry: EnvelopeRegistry::new(),
                metrics: Arc::new(P2pMetrics::unregistered().expect("fresh registry")),
            },
        )
        .expect("valid config");

        AppState {
            version: "test".into(),
            p2p: Arc::new(module),
            heights,
        }
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .clone()
            .oneshot(Request::get(path).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes()
            .to_vec();
        (status, body)
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let network = MemoryNetwork::new();
        let router = create_router(test_state(&network));
        let (status, body) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn peers_unavailable_before_start() {
        let network = MemoryNetwork::new();
        let state = test_state(&network);
        let router = create_router(state.clone());

        let (status, _) = get(&router, "/peers").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = get(&router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let status: StatusResponse = serde_json::from_slice(&body).expect("json");
        assert!(!status.started);
        assert_eq!(status.height, 7);
        assert_eq!(status.address, state.p2p.address().to_hex());
        assert_eq!(status.staked_peers, None);
    }

    #[tokio::test]
    async fn peers_by_selector() {
        let network = MemoryNetwork::new();
        let state = test_state(&network);
        state.p2p.start().await.expect("starts");
        let router = create_router(state.clone());

        let (status, body) = get(&router, "/peers?selector=staked").await;
        assert_eq!(status, StatusCode::OK);
        let staked: Vec<PeerResponse> = serde_json::from_slice(&body).expect("json");
        assert_eq!(staked.len(), 2);

        // The background router only knows itself until discovery runs.
        let (_, body) = get(&router, "/peers?selector=unstaked").await;
        let unstaked: Vec<PeerResponse> = serde_json::from_slice(&body).expect("json");
        assert_eq!(unstaked.len(), 1);
        assert_eq!(unstaked[0].address, state.p2p.address().to_hex());

        let (_, body) = get(&router, "/peers").await;
        let all: Vec<PeerResponse> = serde_json::from_slice(&body).expect("json");
        assert_eq!(all.len(), 2);

        let (status, _) = get(&router, "/peers?selector=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        state.p2p.stop().await.expect("stops");
    }
}

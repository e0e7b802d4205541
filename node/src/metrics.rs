//! # Prometheus Metrics
//!
//! One [`prometheus::Registry`] per node holds the P2P layer's metrics and
//! the few the node itself reports. Scraped at `/metrics` on the metrics
//! port.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

use pocket_p2p::{P2pMetrics, RouterKind};

/// Every metric handle the node owns.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Handles passed into the P2P module.
    pub p2p: Arc<P2pMetrics>,
    /// Latest committed height.
    pub block_height: IntGauge,
    /// Envelopes received from the network, labelled by router.
    pub inbound_messages_total: IntCounterVec,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("pocket".into()), None)?;
        let p2p = Arc::new(P2pMetrics::new(&registry)?);

        let block_height = IntGauge::new("block_height", "Height of the latest committed block")?;
        registry.register(Box::new(block_height.clone()))?;

        let inbound_messages_total = IntCounterVec::new(
            Opts::new(
                "inbound_messages_total",
                "Envelopes handed to the node by the P2P module",
            ),
            &["router"],
        )?;
        registry.register(Box::new(inbound_messages_total.clone()))?;

        Ok(Self {
            registry,
            p2p,
            block_height,
            inbound_messages_total,
        })
    }

    /// Counts one inbound envelope.
    pub fn record_inbound(&self, source: RouterKind) {
        self.inbound_messages_total
            .with_label_values(&[source.as_str()])
            .inc();
    }

    /// Encodes all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

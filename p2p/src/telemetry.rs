//! # P2P Metrics
//!
//! Prometheus handles for the routers. The caller owns the
//! [`Registry`](prometheus::Registry); the node binary exposes it at
//! `/metrics`.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGaugeVec, Opts, Registry};

use crate::router::RouterKind;

/// Bucket upper bounds for copies-per-nonce.
const REDUNDANCY_BUCKETS: &[f64] = &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 8.0, 10.0, 15.0];

/// Every metric the P2P layer reports.
#[derive(Clone, Debug)]
pub struct P2pMetrics {
    /// RainTree messages written to a stream.
    pub raintree_messages_sent_total: IntCounter,
    /// RainTree sends that failed to open or write.
    pub raintree_send_failures_total: IntCounter,
    /// Inbound RainTree copies of an already delivered nonce.
    pub raintree_duplicates_total: IntCounter,
    /// RainTree payloads delivered upward.
    pub raintree_deliveries_total: IntCounter,
    /// Copies received per nonce, observed at block commit.
    pub raintree_redundancy: Histogram,
    /// Background messages published to the topic.
    pub background_published_total: IntCounter,
    /// Background messages refused by the topic validator.
    pub background_rejected_total: IntCounter,
    /// Inbound streams accepted.
    pub unicast_streams_total: IntCounter,
    /// Inbound streams that failed or timed out.
    pub unicast_stream_errors_total: IntCounter,
    /// Peerstore size, labelled by router.
    pub peerstore_size: IntGaugeVec,
}

impl P2pMetrics {
    /// Creates every metric and registers it with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            raintree_messages_sent_total: IntCounter::new(
                "raintree_messages_sent_total",
                "RainTree messages written to a peer stream",
            )?,
            raintree_send_failures_total: IntCounter::new(
                "raintree_send_failures_total",
                "RainTree sends that failed to open or write a stream",
            )?,
            raintree_duplicates_total: IntCounter::new(
                "raintree_duplicates_total",
                "Inbound RainTree copies of an already delivered nonce",
            )?,
            raintree_deliveries_total: IntCounter::new(
                "raintree_deliveries_total",
                "RainTree payloads delivered to the node",
            )?,
            raintree_redundancy: Histogram::with_opts(
                HistogramOpts::new(
                    "raintree_redundancy",
                    "Copies of one RainTree broadcast received by this node",
                )
                .buckets(REDUNDANCY_BUCKETS.to_vec()),
            )?,
            background_published_total: IntCounter::new(
                "background_published_total",
                "Messages published on the background topic",
            )?,
            background_rejected_total: IntCounter::new(
                "background_rejected_total",
                "Background messages rejected by the topic validator",
            )?,
            unicast_streams_total: IntCounter::new(
                "unicast_streams_total",
                "Inbound streams accepted",
            )?,
            unicast_stream_errors_total: IntCounter::new(
                "unicast_stream_errors_total",
                "Inbound streams that failed or timed out",
            )?,
            peerstore_size: IntGaugeVec::new(
                Opts::new("peerstore_size", "Peers known to a router"),
                &["router"],
            )?,
        };

        registry.register(Box::new(metrics.raintree_messages_sent_total.clone()))?;
        registry.register(Box::new(metrics.raintree_send_failures_total.clone()))?;
        registry.register(Box::new(metrics.raintree_duplicates_total.clone()))?;
        registry.register(Box::new(metrics.raintree_deliveries_total.clone()))?;
        registry.register(Box::new(metrics.raintree_redundancy.clone()))?;
        registry.register(Box::new(metrics.background_published_total.clone()))?;
        registry.register(Box::new(metrics.background_rejected_total.clone()))?;
        registry.register(Box::new(metrics.unicast_streams_total.clone()))?;
        registry.register(Box::new(metrics.unicast_stream_errors_total.clone()))?;
        registry.register(Box::new(metrics.peerstore_size.clone()))?;

        Ok(metrics)
    }

    /// Metrics registered with a private registry nobody scrapes.
    pub fn unregistered() -> Result<Self, prometheus::Error> {
        Self::new(&Registry::new())
    }

    /// Records a router's peerstore size.
    pub fn set_peerstore_size(&self, router: RouterKind, size: usize) {
        self.peerstore_size
            .with_label_values(&[router.as_str()])
            .set(size as i64);
    }

    /// Feeds drained per-nonce copy counts into the redundancy histogram.
    pub fn observe_redundancy(&self, counts: &[(u64, u32)]) {
        for (_, copies) in counts {
            self.raintree_redundancy.observe(f64::from(*copies));
        }
    }
}

//! Application state shared by the HTTP handlers.

use metrics_exporter_prometheus::PrometheusHandle;
use order_ingest_core::OrderStore;
use order_ingest_runtime::{ConsumerState, OrderProducer};
use std::sync::Arc;
use tokio::sync::watch;

/// Handles the HTTP surface needs: the enqueue path, read access to the
/// store, the consumer's lifecycle and the metrics renderer.
#[derive(Clone)]
pub struct AppState {
    /// Enqueue path
    pub producer: OrderProducer,
    /// Read access for the query endpoints and readiness
    pub store: Arc<dyn OrderStore>,
    /// Consumer lifecycle, for readiness
    pub consumer: watch::Receiver<ConsumerState>,
    /// Prometheus renderer
    pub metrics: PrometheusHandle,
}

impl AppState {
    /// Bundles the handles.
    #[must_use]
    pub fn new(
        producer: OrderProducer,
        store: Arc<dyn OrderStore>,
        consumer: watch::Receiver<ConsumerState>,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            producer,
            store,
            consumer,
            metrics,
        }
    }
}

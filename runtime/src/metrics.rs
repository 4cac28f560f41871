//! Prometheus metrics for the ingestion pipeline.
//!
//! Covers:
//! - Producer submissions and publish failures
//! - Consumer outcomes (committed, duplicate, dead-lettered) and latency
//! - Reconnects and in-flight deliveries
//! - Store query latency (recorded by the store adapter)
//!
//! # Example
//!
//! ```rust,no_run
//! use order_ingest_runtime::metrics;
//!
//! # fn example() -> Result<(), metrics::MetricsError> {
//! let handle = metrics::install()?;
//! // Serve `handle.render()` at GET /metrics
//! # Ok(())
//! # }
//! ```

use ::metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

pub use ::metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Builds the Prometheus exporter with latency buckets for every
/// `*_duration_seconds` histogram.
///
/// # Errors
///
/// Returns [`MetricsError::Build`] if the bucket configuration is rejected.
pub fn builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .map_err(|e| MetricsError::Build(e.to_string()))
}

/// Installs the global recorder and returns the handle used to render it.
///
/// # Errors
///
/// Returns [`MetricsError::Install`] if a recorder is already installed.
pub fn install() -> Result<PrometheusHandle, MetricsError> {
    let handle = builder()?
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))?;
    register_metrics();
    tracing::info!("Prometheus recorder installed");
    Ok(handle)
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "orders_submitted_total",
        "Submissions accepted and published to the orders queue"
    );
    describe_counter!(
        "orders_submit_failures_total",
        "Submissions that could not be published"
    );
    describe_counter!(
        "orders_committed_total",
        "Orders committed to the store by the consumer"
    );
    describe_counter!(
        "orders_duplicate_total",
        "Deliveries absorbed because the business key already exists"
    );
    describe_counter!(
        "orders_dead_lettered_total",
        "Deliveries rejected to the dead-letter queue, by reason"
    );
    describe_counter!(
        "consumer_reconnects_total",
        "Times the consumer lost or failed to open its broker connection"
    );
    describe_histogram!(
        "order_processing_duration_seconds",
        "Time from delivery to outcome for one message"
    );
    describe_histogram!(
        "order_store_query_duration_seconds",
        "Time taken by store operations"
    );
    describe_gauge!(
        "consumer_in_flight",
        "Deliveries currently being processed"
    );
}

/// Producer metrics recorder.
pub struct ProducerMetrics;

impl ProducerMetrics {
    /// Record an accepted submission.
    pub fn record_submitted() {
        counter!("orders_submitted_total").increment(1);
    }

    /// Record a publish failure.
    pub fn record_failure() {
        counter!("orders_submit_failures_total").increment(1);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a committed order.
    pub fn record_committed(duration: Duration) {
        counter!("orders_committed_total").increment(1);
        histogram!("order_processing_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an absorbed duplicate.
    pub fn record_duplicate(duration: Duration) {
        counter!("orders_duplicate_total").increment(1);
        histogram!("order_processing_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a dead-lettered delivery.
    pub fn record_dead_lettered(reason: &'static str, duration: Duration) {
        counter!("orders_dead_lettered_total", "reason" => reason).increment(1);
        histogram!("order_processing_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a lost or failed connection.
    pub fn record_reconnect() {
        counter!("consumer_reconnects_total").increment(1);
    }

    /// A delivery entered processing.
    pub fn record_started() {
        gauge!("consumer_in_flight").increment(1.0);
    }

    /// A delivery left processing.
    pub fn record_finished() {
        gauge!("consumer_in_flight").decrement(1.0);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_metrics() {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();

        ::metrics::with_local_recorder(&recorder, || {
            ProducerMetrics::record_submitted();
            ConsumerMetrics::record_committed(Duration::from_millis(12));
            ConsumerMetrics::record_dead_lettered("invalid", Duration::from_millis(1));
        });

        let rendered = handle.render();
        assert!(rendered.contains("orders_submitted_total 1"));
        assert!(rendered.contains("orders_committed_total 1"));
        assert!(rendered.contains(r#"orders_dead_lettered_total{reason="invalid"} 1"#));
        assert!(rendered.contains("order_processing_duration_seconds_bucket"));
    }
}

//! # Order Ingest Runtime
//!
//! The moving parts of the ingestion pipeline.
//!
//! ## Core Components
//!
//! - [`OrderProducer`]: validates a submission and publishes it, returning
//!   before anything is persisted
//! - [`OrderProcessor`]: turns one message body into an outcome (committed,
//!   duplicate, or rejected) against an [`OrderStore`](order_ingest_core::OrderStore)
//! - [`OrderConsumer`]: the reconnecting, prefetch-bounded consume loop that
//!   acknowledges only after a commit
//!
//! ## Example
//!
//! ```ignore
//! use order_ingest_runtime::{ConsumerConfig, OrderConsumer, OrderProcessor, OrderProducer};
//!
//! let producer = OrderProducer::new(Arc::clone(&gateway));
//! let processor = Arc::new(OrderProcessor::new(store, Arc::new(SystemClock)));
//! let (consumer, shutdown) = OrderConsumer::new(gateway, processor, ConsumerConfig::default());
//!
//! tokio::spawn(consumer.run());
//! producer.submit_json(body).await?;
//! ```

/// Reconnecting consumer state machine
pub mod consumer;

/// Prometheus metrics for observability
pub mod metrics;

/// Per-message processing
pub mod processor;

/// Enqueue path and synthetic load
pub mod producer;

/// Retry logic with exponential backoff
pub mod retry;

/// Commit throughput measurement
pub mod throughput;

pub use consumer::{ConsumerConfig, ConsumerError, ConsumerState, OrderConsumer};
pub use processor::{Disposition, OrderProcessor, ProcessingError, ProcessingOutcome};
pub use producer::{
    GenerationReport, MAX_TEST_ORDERS, OrderProducer, SubmissionReceipt, SubmitError,
    TestOrderBatch,
};
pub use retry::RetryPolicy;
pub use throughput::{ThroughputMeter, ThroughputSample};

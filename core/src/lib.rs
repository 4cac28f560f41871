//! # Order Ingest Core
//!
//! Domain types and trait seams for the asynchronous order ingestion pipeline.
//!
//! This crate has no I/O of its own. It defines:
//!
//! - [`order`]: the persisted [`OrderRecord`], its [`OrderStatus`] lifecycle and
//!   the exact-decimal [`compute_total`] function
//! - [`submission`]: the JSON wire shape published to and consumed from the queue
//! - [`queue`]: the [`QueueGateway`] seam shared by producer and consumer, plus
//!   message-scoped [`Delivery`] handles
//! - [`store`]: the [`OrderStore`] persistence boundary
//! - [`environment`]: injected dependencies such as the [`environment::Clock`]
//!
//! ## Data Flow
//!
//! ```text
//! client ─► Producer ─► QueueGateway ─► Consumer ─► OrderStore ─► Read API
//!                         (orders)         │
//!                                          └─► orders.dlx ─► orders.dead-letter
//! ```
//!
//! ## Implementations
//!
//! - `order-ingest-amqp`: RabbitMQ gateway (lapin)
//! - `order-ingest-postgres`: `PostgreSQL` store (sqlx)
//! - `order-ingest-testing`: in-memory broker and store for tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod order;
pub mod queue;
pub mod store;
pub mod submission;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use order::{LineItem, OrderError, OrderRecord, OrderStatus, compute_total};
pub use queue::{Acknowledger, Delivery, QueueError, QueueGateway, QueueSession, QueueTopology};
pub use rust_decimal::Decimal;
pub use store::{OrderQuery, OrderStore, Page, StoreError};
pub use submission::{OrderSubmission, SubmissionError, SubmissionItem};

/// Injected dependencies.
///
/// All time-dependent behaviour goes through these traits so tests can run
/// against deterministic implementations.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use order_ingest_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = chrono::Utc::now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time in UTC.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

//! # Order Ingest Testing
//!
//! Testing utilities for the order ingestion pipeline.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: a [`QueueGateway`](order_ingest_core::QueueGateway)
//!   with prefetch, dead-lettering, severable connections and failure injection
//! - [`InMemoryOrderStore`]: an [`OrderStore`](order_ingest_core::OrderStore)
//!   with a real uniqueness constraint and failure/latency injection
//! - [`FixedClock`] and [`test_clock`] for deterministic timestamps
//! - [`fixtures`] for common submissions
//!
//! ## Example
//!
//! ```ignore
//! use order_ingest_testing::{InMemoryBroker, InMemoryOrderStore, fixtures};
//!
//! #[tokio::test]
//! async fn duplicate_is_absorbed() {
//!     let broker = InMemoryBroker::new();
//!     let store = InMemoryOrderStore::new();
//!     broker.inject(fixtures::widget_body("A-1"));
//!     broker.inject(fixtures::widget_body("A-1"));
//!     // run the consumer ...
//!     assert_eq!(store.len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use order_ingest_core::environment::Clock;

pub mod broker;
pub mod order_store;

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use order_ingest_testing::mocks::FixedClock;
    /// use order_ingest_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Common submissions.
pub mod fixtures {
    use order_ingest_core::{Decimal, OrderSubmission, SubmissionItem};

    /// One line: `Widget`, quantity 2 at 50.25 (total 100.50).
    #[must_use]
    pub fn widget_submission(external_id: &str) -> OrderSubmission {
        OrderSubmission::new(
            external_id,
            vec![SubmissionItem::new("Widget", 2, Decimal::new(5025, 2))],
        )
    }

    /// [`widget_submission`] encoded as a queue message body.
    #[must_use]
    pub fn widget_body(external_id: &str) -> Vec<u8> {
        format!(
            r#"{{"ExternalId":"{external_id}","Items":[{{"Name":"Widget","Quantity":2,"UnitPrice":50.25}}]}}"#
        )
        .into_bytes()
    }

    /// Three lines totalling exactly 30.50.
    #[must_use]
    pub fn mixed_submission(external_id: &str) -> OrderSubmission {
        OrderSubmission::new(
            external_id,
            vec![
                SubmissionItem::new("A", 2, Decimal::new(1050, 2)),
                SubmissionItem::new("B", 1, Decimal::new(500, 2)),
                SubmissionItem::new("C", 3, Decimal::new(150, 2)),
            ],
        )
    }
}

/// Installs a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

// Re-export commonly used items
pub use broker::{BrokerStats, InMemoryBroker};
pub use mocks::{FixedClock, test_clock};
pub use order_store::InMemoryOrderStore;

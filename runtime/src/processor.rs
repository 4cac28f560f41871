//! Per-message processing: parse, validate, deduplicate, calculate, commit.
//!
//! The processor decides the outcome; settling the delivery with the broker
//! is left to the caller so that acknowledgement can only follow a commit.

use crate::metrics::ConsumerMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use order_ingest_core::environment::Clock;
use order_ingest_core::{
    OrderError, OrderRecord, OrderStore, OrderSubmission, StoreError, SubmissionError,
};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Why a delivery was dead-lettered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// The body does not parse or fails validation.
    #[error("invalid submission: {0}")]
    Invalid(#[from] SubmissionError),

    /// The order could not be built (total overflow).
    #[error("order rejected: {0}")]
    Order(#[from] OrderError),

    /// The store failed, after any retries.
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    /// Processing panicked.
    #[error("processing panicked: {0}")]
    Panicked(String),
}

impl ProcessingError {
    /// Short label used for the `reason` metric dimension.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid",
            Self::Order(_) => "order",
            Self::Store(_) => "store",
            Self::Panicked(_) => "panic",
        }
    }
}

/// What the broker should be told about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue.
    Ack,
    /// Reject without requeue, into the dead-letter queue.
    DeadLetter,
}

/// Result of processing one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// A new record was committed.
    Committed(OrderRecord),
    /// The business key already had a record; nothing was written.
    Duplicate {
        /// Business key of the absorbed delivery
        external_id: String,
    },
    /// The message can never succeed.
    Rejected(ProcessingError),
}

impl ProcessingOutcome {
    /// How the delivery must be settled.
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        match self {
            Self::Committed(_) | Self::Duplicate { .. } => Disposition::Ack,
            Self::Rejected(_) => Disposition::DeadLetter,
        }
    }
}

/// Turns message bodies into committed order records.
///
/// Safe to share between concurrently processed deliveries; each store call
/// acquires its own connection.
pub struct OrderProcessor {
    store: Arc<dyn OrderStore>,
    clock: Arc<dyn Clock>,
    commit_retry: RetryPolicy,
}

impl OrderProcessor {
    /// Creates a processor with the default commit retry policy.
    #[must_use]
    pub fn new(store: Arc<dyn OrderStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            commit_retry: RetryPolicy::default(),
        }
    }

    /// Sets the retry policy for transient store failures.
    #[must_use]
    pub const fn with_commit_retry(mut self, policy: RetryPolicy) -> Self {
        self.commit_retry = policy;
        self
    }

    /// Processes one message body.
    ///
    /// Never fails: every error becomes [`ProcessingOutcome::Rejected`].
    pub async fn process(&self, body: &[u8]) -> ProcessingOutcome {
        let started = Instant::now();
        let outcome = match self.try_process(body).await {
            Ok(outcome) => outcome,
            Err(error) => ProcessingOutcome::Rejected(error),
        };
        let elapsed = started.elapsed();

        match &outcome {
            ProcessingOutcome::Committed(record) => {
                ConsumerMetrics::record_committed(elapsed);
                tracing::info!(
                    external_id = %record.external_id(),
                    total_value = %record.total_value(),
                    items = record.items().len(),
                    "Order committed"
                );
            }
            ProcessingOutcome::Duplicate { external_id } => {
                ConsumerMetrics::record_duplicate(elapsed);
                tracing::info!(external_id = %external_id, "Duplicate order dropped");
            }
            ProcessingOutcome::Rejected(error) => {
                ConsumerMetrics::record_dead_lettered(error.reason(), elapsed);
                tracing::error!(
                    error = %error,
                    payload = %String::from_utf8_lossy(body),
                    "Order dead-lettered"
                );
            }
        }
        outcome
    }

    async fn try_process(&self, body: &[u8]) -> Result<ProcessingOutcome, ProcessingError> {
        let submission = OrderSubmission::from_json(body)?;
        submission.validate()?;
        let external_id = submission.external_id.as_str();

        // Fast path only: the unique constraint decides under concurrency.
        let exists = retry_with_predicate(
            self.commit_retry,
            || self.store.exists(external_id),
            StoreError::is_transient,
        )
        .await?;
        if exists {
            return Ok(ProcessingOutcome::Duplicate {
                external_id: submission.external_id,
            });
        }

        let mut record =
            OrderRecord::new(external_id, submission.line_items(), self.clock.now())?;
        record.calculate()?;

        let committed = retry_with_predicate(
            self.commit_retry,
            || self.store.insert(&record),
            StoreError::is_transient,
        )
        .await;

        match committed {
            Ok(()) => Ok(ProcessingOutcome::Committed(record)),
            Err(StoreError::DuplicateKey(_)) => Ok(ProcessingOutcome::Duplicate {
                external_id: submission.external_id,
            }),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use order_ingest_core::{Decimal, OrderStatus};
    use order_ingest_testing::{InMemoryOrderStore, fixtures, test_clock};
    use std::time::Duration;

    fn processor(store: &InMemoryOrderStore) -> OrderProcessor {
        OrderProcessor::new(Arc::new(store.clone()), Arc::new(test_clock())).with_commit_retry(
            RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(Duration::from_millis(1))
                .build(),
        )
    }

    #[tokio::test]
    async fn commits_calculated_record() {
        let store = InMemoryOrderStore::new();

        let outcome = processor(&store).process(&fixtures::widget_body("E2E-1")).await;

        assert_eq!(outcome.disposition(), Disposition::Ack);
        let ProcessingOutcome::Committed(record) = outcome else {
            panic!("expected a commit");
        };
        assert_eq!(record.status(), OrderStatus::Calculated);
        assert_eq!(record.total_value(), Decimal::new(10050, 2));
        assert_eq!(record.created_at(), test_clock().now());
        assert_eq!(store.get("E2E-1"), Some(record));
    }

    #[tokio::test]
    async fn empty_item_list_commits_zero_total() {
        let store = InMemoryOrderStore::new();

        let outcome = processor(&store)
            .process(br#"{"ExternalId":"EMPTY","Items":[]}"#)
            .await;

        assert!(matches!(outcome, ProcessingOutcome::Committed(_)));
        assert_eq!(store.get("EMPTY").unwrap().total_value(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn long_numeric_price_is_committed_exactly() {
        let store = InMemoryOrderStore::new();

        processor(&store)
            .process(br#"{"ExternalId":"P-1","Items":[{"Name":"x","Quantity":3,"UnitPrice":0.1234567890123456789}]}"#)
            .await;

        let record = store.get("P-1").unwrap();
        assert_eq!(record.total_value().to_string(), "0.3703703670370370367");
    }

    #[tokio::test]
    async fn existing_key_is_a_duplicate_without_insert() {
        let store = InMemoryOrderStore::new();
        let processor = processor(&store);
        processor.process(&fixtures::widget_body("D-1")).await;

        let outcome = processor
            .process(br#"{"ExternalId":"D-1","Items":[{"Name":"Other","Quantity":9,"UnitPrice":1}]}"#)
            .await;

        assert_eq!(
            outcome,
            ProcessingOutcome::Duplicate {
                external_id: "D-1".to_string()
            }
        );
        assert_eq!(store.insert_attempts(), 1);
        assert_eq!(store.get("D-1").unwrap().total_value(), Decimal::new(10050, 2));
    }

    #[tokio::test]
    async fn constraint_violation_degrades_to_duplicate() {
        let store = InMemoryOrderStore::new();
        store.set_stale_reads(true);
        let processor = processor(&store);
        processor.process(&fixtures::widget_body("RACE")).await;

        let outcome = processor.process(&fixtures::widget_body("RACE")).await;

        assert_eq!(outcome.disposition(), Disposition::Ack);
        assert!(matches!(outcome, ProcessingOutcome::Duplicate { .. }));
        assert_eq!(store.duplicate_rejections(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn malformed_and_keyless_bodies_are_dead_lettered() {
        let store = InMemoryOrderStore::new();
        let processor = processor(&store);

        let bodies: [&[u8]; 3] = [b"not json", br#"{"Items":[]}"#, br#"{"ExternalId":""}"#];
        for body in bodies {
            let outcome = processor.process(body).await;
            assert_eq!(outcome.disposition(), Disposition::DeadLetter);
            let ProcessingOutcome::Rejected(error) = outcome else {
                panic!("expected a rejection");
            };
            assert_eq!(error.reason(), "invalid");
        }
        assert_eq!(store.insert_attempts(), 0);
    }

    #[tokio::test]
    async fn transient_commit_failure_is_retried() {
        let store = InMemoryOrderStore::new();
        store.fail_next_inserts(2);

        let outcome = processor(&store).process(&fixtures::widget_body("T-1")).await;

        assert!(matches!(outcome, ProcessingOutcome::Committed(_)));
        assert_eq!(store.insert_attempts(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let store = InMemoryOrderStore::new();
        store.fail_next_inserts(3);

        let outcome = processor(&store).process(&fixtures::widget_body("T-2")).await;

        let ProcessingOutcome::Rejected(error) = outcome else {
            panic!("expected a rejection");
        };
        assert_eq!(error.reason(), "store");
        assert!(matches!(error, ProcessingError::Store(StoreError::Unavailable(_))));
        assert_eq!(store.insert_attempts(), 3);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn overflowing_total_is_dead_lettered() {
        let store = InMemoryOrderStore::new();
        let body = format!(
            r#"{{"ExternalId":"BIG","Items":[{{"Name":"x","Quantity":4294967295,"UnitPrice":"{}"}}]}}"#,
            Decimal::MAX
        );

        let outcome = processor(&store).process(body.as_bytes()).await;

        let ProcessingOutcome::Rejected(error) = outcome else {
            panic!("expected a rejection");
        };
        assert_eq!(error, ProcessingError::Order(OrderError::TotalOverflow));
    }
}

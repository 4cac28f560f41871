//! Enqueue path: validate, publish, return immediately.
//!
//! The producer never waits for persistence and never checks for duplicates;
//! deduplication belongs to the consumer and the store.

use crate::metrics::ProducerMetrics;
use order_ingest_core::{
    Decimal, OrderStatus, OrderSubmission, QueueError, QueueGateway, SubmissionError,
    SubmissionItem,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Largest accepted test-order batch.
pub const MAX_TEST_ORDERS: u32 = 1_000_000;

const PROGRESS_EVERY: u32 = 1000;

/// Why a submission was not accepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The submission failed parsing or validation.
    #[error(transparent)]
    Invalid(#[from] SubmissionError),

    /// The broker did not take the message.
    #[error("order could not be queued, retry later: {0}")]
    Publish(#[from] QueueError),

    /// A test-order batch size outside `1..=MAX_TEST_ORDERS`.
    #[error("count must be between 1 and 1000000, got {0}")]
    InvalidCount(u64),
}

impl SubmitError {
    /// Whether the caller sent something that can never be accepted.
    ///
    /// Everything else is a server-side failure the caller should retry.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        match self {
            Self::Invalid(SubmissionError::Serialization(_)) | Self::Publish(_) => false,
            Self::Invalid(_) | Self::InvalidCount(_) => true,
        }
    }
}

/// Accepted-for-processing acknowledgement. Not a guarantee of persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    /// Business key of the accepted order
    pub external_id: String,
    /// Always [`OrderStatus::Received`]
    pub status: OrderStatus,
}

/// Parameters of a synthetic load batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestOrderBatch {
    count: u32,
    products_per_order: u32,
    delay: Duration,
}

impl TestOrderBatch {
    /// Validates the batch size.
    ///
    /// # Errors
    ///
    /// [`SubmitError::InvalidCount`] unless `1 <= count <= MAX_TEST_ORDERS`.
    pub fn new(count: u64, products_per_order: u32, delay: Duration) -> Result<Self, SubmitError> {
        let count = u32::try_from(count)
            .ok()
            .filter(|n| (1..=MAX_TEST_ORDERS).contains(n))
            .ok_or(SubmitError::InvalidCount(count))?;
        Ok(Self {
            count,
            products_per_order: products_per_order.max(1),
            delay,
        })
    }

    /// Orders to publish.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Upper bound (exclusive) on the number of lines per generated order.
    #[must_use]
    pub fn max_lines(&self) -> u32 {
        self.products_per_order.saturating_mul(2).saturating_sub(1).max(2)
    }
}

/// Outcome of [`OrderProducer::generate_test_orders`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenerationReport {
    /// Orders published
    pub published: u32,
    /// Whether the batch stopped early on a publish failure
    pub aborted: bool,
}

/// Publishes validated submissions to the orders queue.
#[derive(Clone)]
pub struct OrderProducer {
    gateway: Arc<dyn QueueGateway>,
}

impl OrderProducer {
    /// Creates a producer over `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<dyn QueueGateway>) -> Self {
        Self { gateway }
    }

    /// Parses a raw JSON body and submits it.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit); additionally
    /// [`SubmissionError::Malformed`] for a body that does not parse.
    pub async fn submit_json(&self, body: &[u8]) -> Result<SubmissionReceipt, SubmitError> {
        let submission = OrderSubmission::from_json(body)?;
        self.submit(&submission).await
    }

    /// Validates and publishes one submission.
    ///
    /// Validation happens before any queue interaction; exactly one publish
    /// is made per accepted submission.
    ///
    /// # Errors
    ///
    /// [`SubmitError::Invalid`] for a blank business key or a negative price,
    /// [`SubmitError::Publish`] when the broker is unreachable.
    pub async fn submit(
        &self,
        submission: &OrderSubmission,
    ) -> Result<SubmissionReceipt, SubmitError> {
        submission.validate()?;
        let body = submission.to_json()?;

        if let Err(error) = self.gateway.publish(body).await {
            ProducerMetrics::record_failure();
            tracing::error!(
                external_id = %submission.external_id,
                error = %error,
                "Failed to publish order"
            );
            return Err(error.into());
        }

        ProducerMetrics::record_submitted();
        tracing::debug!(external_id = %submission.external_id, "Order queued");
        Ok(SubmissionReceipt {
            external_id: submission.external_id.clone(),
            status: OrderStatus::Received,
        })
    }

    /// Publishes `batch.count()` random submissions, one after another.
    ///
    /// Stops at the first publish failure.
    pub async fn generate_test_orders(&self, batch: TestOrderBatch) -> GenerationReport {
        let mut rng = StdRng::from_entropy();
        let mut report = GenerationReport::default();
        tracing::info!(count = batch.count, "Generating test orders");

        for _ in 0..batch.count {
            let submission = random_submission(&mut rng, &batch);
            if let Err(error) = self.submit(&submission).await {
                tracing::error!(
                    published = report.published,
                    error = %error,
                    "Test order generation aborted"
                );
                report.aborted = true;
                return report;
            }
            report.published += 1;

            if report.published % PROGRESS_EVERY == 0 {
                tracing::info!(
                    published = report.published,
                    total = batch.count,
                    "Test order generation progress"
                );
            }
            if !batch.delay.is_zero() {
                tokio::time::sleep(batch.delay).await;
            }
        }

        tracing::info!(published = report.published, "Test order generation finished");
        report
    }
}

/// `TEST_ORDER_<uuid>` with `1..max_lines` lines, quantities `1..5` and
/// prices in `0.99..=100.98`.
pub(crate) fn random_submission(rng: &mut impl Rng, batch: &TestOrderBatch) -> OrderSubmission {
    let lines = rng.gen_range(1..batch.max_lines());
    let items = (0..lines)
        .map(|_| {
            SubmissionItem::new(
                format!("Product {}", rng.gen_range(1..=1000)),
                rng.gen_range(1..5),
                Decimal::new(rng.gen_range(99..=10_098), 2),
            )
        })
        .collect();
    OrderSubmission::new(format!("TEST_ORDER_{}", uuid::Uuid::new_v4()), items)
}

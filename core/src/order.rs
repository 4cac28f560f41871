//! The persisted Order Record and its invariants.
//!
//! An [`OrderRecord`] owns its line items exclusively and keeps `total_value`
//! equal to the exact decimal sum of `quantity × unit_price` at all times: the
//! only ways to change the items ([`OrderRecord::new`] and
//! [`OrderRecord::replace_items`]) recompute it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while building or mutating an [`OrderRecord`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    /// The business key is empty or whitespace.
    #[error("externalId must be a non-blank string")]
    BlankExternalId,

    /// A line item carries a negative unit price.
    #[error("item {index} has a negative unit price")]
    NegativeUnitPrice {
        /// Position of the offending item.
        index: usize,
    },

    /// The total does not fit in a 96-bit decimal.
    #[error("order total overflows the decimal range")]
    TotalOverflow,

    /// A status string that is not part of the closed enumeration.
    #[error("unknown order status: {0}")]
    UnknownStatus(String),

    /// A status change the lifecycle does not allow.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: OrderStatus,
        /// Requested status.
        to: OrderStatus,
    },
}

/// Lifecycle status of an order.
///
/// Persisted and exposed as its stable upper-case name, never as an ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Accepted by the producer and sitting in the queue.
    Received,
    /// Picked up by the consumer.
    Processing,
    /// Total computed and committed.
    Calculated,
    /// A repeat submission of an existing business key.
    Duplicated,
    /// Unrecoverable processing failure.
    Error,
}

impl OrderStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Received,
        Self::Processing,
        Self::Calculated,
        Self::Duplicated,
        Self::Error,
    ];

    /// Stable text encoding used for storage and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Processing => "PROCESSING",
            Self::Calculated => "CALCULATED",
            Self::Duplicated => "DUPLICATED",
            Self::Error => "ERROR",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `Calculated`, `Duplicated` and `Error` are terminal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::Processing)
                | (Self::Processing, Self::Calculated | Self::Duplicated | Self::Error)
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Calculated | Self::Duplicated | Self::Error)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    /// Parses the stable name, ignoring ASCII case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| OrderError::UnknownStatus(s.to_string()))
    }
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Product name.
    pub name: String,
    /// Units ordered.
    pub quantity: u32,
    /// Price per unit, never negative.
    pub unit_price: Decimal,
}

impl LineItem {
    /// Creates a line item.
    #[must_use]
    pub fn new(name: impl Into<String>, quantity: u32, unit_price: Decimal) -> Self {
        Self {
            name: name.into(),
            quantity,
            unit_price,
        }
    }

    /// `quantity × unit_price`, or `None` on overflow.
    #[must_use]
    pub fn total(&self) -> Option<Decimal> {
        Decimal::from(self.quantity).checked_mul(self.unit_price)
    }
}

/// Sums `quantity × unit_price` over `items` using exact decimal arithmetic.
///
/// Returns exactly zero for an empty slice.
///
/// # Errors
///
/// Returns [`OrderError::TotalOverflow`] if a line total or the running sum
/// leaves the decimal range.
///
/// # Examples
///
/// ```
/// use order_ingest_core::{LineItem, compute_total};
/// use rust_decimal::Decimal;
///
/// let items = vec![
///     LineItem::new("a", 2, Decimal::new(1050, 2)),
///     LineItem::new("b", 1, Decimal::new(500, 2)),
///     LineItem::new("c", 3, Decimal::new(150, 2)),
/// ];
/// assert_eq!(compute_total(&items), Ok(Decimal::new(3050, 2)));
/// ```
pub fn compute_total(items: &[LineItem]) -> Result<Decimal, OrderError> {
    items.iter().try_fold(Decimal::ZERO, |sum, item| {
        item.total()
            .and_then(|line| sum.checked_add(line))
            .ok_or(OrderError::TotalOverflow)
    })
}

fn validate_items(items: &[LineItem]) -> Result<(), OrderError> {
    match items.iter().position(|item| item.unit_price < Decimal::ZERO) {
        Some(index) => Err(OrderError::NegativeUnitPrice { index }),
        None => Ok(()),
    }
}

/// A persisted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRecord {
    external_id: String,
    status: OrderStatus,
    created_at: DateTime<Utc>,
    total_value: Decimal,
    items: Vec<LineItem>,
}

impl OrderRecord {
    /// Builds a record in `PROCESSING` status, as the consumer does on pickup.
    ///
    /// # Errors
    ///
    /// Fails on a blank business key, a negative unit price or a total
    /// overflow.
    pub fn new(
        external_id: impl Into<String>,
        items: Vec<LineItem>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, OrderError> {
        let external_id = external_id.into();
        if external_id.trim().is_empty() {
            return Err(OrderError::BlankExternalId);
        }
        validate_items(&items)?;
        let total_value = compute_total(&items)?;

        Ok(Self {
            external_id,
            status: OrderStatus::Processing,
            created_at,
            total_value,
            items,
        })
    }

    /// Rebuilds a record read back from storage.
    ///
    /// The stored total is kept as-is; callers that need to check it against
    /// the items can compare with [`compute_total`].
    #[must_use]
    pub const fn restore(
        external_id: String,
        status: OrderStatus,
        created_at: DateTime<Utc>,
        total_value: Decimal,
        items: Vec<LineItem>,
    ) -> Self {
        Self {
            external_id,
            status,
            created_at,
            total_value,
            items,
        }
    }

    /// Replaces the line items and recomputes the total.
    ///
    /// # Errors
    ///
    /// Fails on a negative unit price or a total overflow; the record is left
    /// unchanged in that case.
    pub fn replace_items(&mut self, items: Vec<LineItem>) -> Result<(), OrderError> {
        validate_items(&items)?;
        self.total_value = compute_total(&items)?;
        self.items = items;
        Ok(())
    }

    /// Recomputes the total and advances to `CALCULATED`.
    ///
    /// # Errors
    ///
    /// Fails if the record is not `PROCESSING` or the total overflows.
    pub fn calculate(&mut self) -> Result<(), OrderError> {
        self.total_value = compute_total(&self.items)?;
        self.transition_to(OrderStatus::Calculated)
    }

    /// Moves to `next` if the lifecycle allows it.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::InvalidTransition`] otherwise.
    pub fn transition_to(&mut self, next: OrderStatus) -> Result<(), OrderError> {
        if !self.status.can_transition_to(next) {
            return Err(OrderError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Business key.
    #[must_use]
    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> OrderStatus {
        self.status
    }

    /// Creation instant (UTC).
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Sum of all line totals.
    #[must_use]
    pub const fn total_value(&self) -> Decimal {
        self.total_value
    }

    /// Line items in submission order.
    #[must_use]
    pub fn items(&self) -> &[LineItem] {
        &self.items
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn item(quantity: u32, cents: i64) -> LineItem {
        LineItem::new("item", quantity, Decimal::new(cents, 2))
    }

    #[test]
    fn total_is_exact_for_mixed_lines() {
        let items = vec![item(2, 1050), item(1, 500), item(3, 150)];
        let total = compute_total(&items).unwrap();
        assert_eq!(total, Decimal::new(3050, 2));
        assert_eq!(total.to_string(), "30.50");
    }

    #[test]
    fn total_of_empty_is_zero() {
        assert_eq!(compute_total(&[]).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn total_does_not_drift_like_floats() {
        // 0.1 + 0.2 in binary floating point is 0.30000000000000004
        let items = vec![item(1, 10), item(1, 20)];
        assert_eq!(compute_total(&items).unwrap(), Decimal::new(30, 2));
    }

    #[test]
    fn total_overflow_is_reported() {
        let items = vec![LineItem::new("big", u32::MAX, Decimal::MAX)];
        assert_eq!(compute_total(&items), Err(OrderError::TotalOverflow));
    }

    #[test]
    fn new_record_starts_processing() {
        let record = OrderRecord::new("A-1", vec![item(2, 5025)], at()).unwrap();
        assert_eq!(record.status(), OrderStatus::Processing);
        assert_eq!(record.total_value(), Decimal::new(10050, 2));
        assert_eq!(record.external_id(), "A-1");
    }

    #[test]
    fn blank_key_is_rejected() {
        assert_eq!(
            OrderRecord::new("  ", vec![], at()),
            Err(OrderError::BlankExternalId)
        );
    }

    #[test]
    fn negative_price_is_rejected() {
        let items = vec![item(1, 100), item(1, -1)];
        assert_eq!(
            OrderRecord::new("A-1", items, at()),
            Err(OrderError::NegativeUnitPrice { index: 1 })
        );
    }

    #[test]
    fn replacing_items_recomputes_total() {
        let mut record = OrderRecord::new("A-1", vec![item(1, 100)], at()).unwrap();
        record.replace_items(vec![item(4, 250), item(0, 999)]).unwrap();
        assert_eq!(record.total_value(), Decimal::new(1000, 2));

        record.replace_items(Vec::new()).unwrap();
        assert_eq!(record.total_value(), Decimal::ZERO);
    }

    #[test]
    fn failed_replace_leaves_record_untouched() {
        let mut record = OrderRecord::new("A-1", vec![item(1, 100)], at()).unwrap();
        let before = record.clone();
        assert!(record.replace_items(vec![item(1, -5)]).is_err());
        assert_eq!(record, before);
    }

    #[test]
    fn calculate_advances_once() {
        let mut record = OrderRecord::new("A-1", vec![item(1, 100)], at()).unwrap();
        record.calculate().unwrap();
        assert_eq!(record.status(), OrderStatus::Calculated);
        assert_eq!(
            record.calculate(),
            Err(OrderError::InvalidTransition {
                from: OrderStatus::Calculated,
                to: OrderStatus::Calculated,
            })
        );
    }

    #[test]
    fn status_text_encoding_is_stable() {
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert_eq!("calculated".parse::<OrderStatus>().unwrap(), OrderStatus::Calculated);
        assert!(matches!(
            "SHIPPED".parse::<OrderStatus>(),
            Err(OrderError::UnknownStatus(_))
        ));
    }

    #[test]
    fn terminal_statuses_have_no_exit() {
        for from in OrderStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in OrderStatus::ALL {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    proptest! {
        #[test]
        fn total_matches_integer_cents(lines in prop::collection::vec((0u32..1_000, 0i64..1_000_000), 0..50)) {
            let items: Vec<LineItem> = lines.iter().map(|&(q, c)| item(q, c)).collect();
            let expected_cents: i64 = lines.iter().map(|&(q, c)| i64::from(q) * c).sum();
            prop_assert_eq!(compute_total(&items).unwrap(), Decimal::new(expected_cents, 2));
        }

        #[test]
        fn total_ignores_item_order(lines in prop::collection::vec((0u32..1_000, 0i64..1_000_000), 0..20)) {
            let items: Vec<LineItem> = lines.iter().map(|&(q, c)| item(q, c)).collect();
            let mut reversed = items.clone();
            reversed.reverse();
            prop_assert_eq!(compute_total(&items).unwrap(), compute_total(&reversed).unwrap());
        }
    }
}

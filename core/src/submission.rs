//! The order submission as it travels through the queue.
//!
//! Wire format (UTF-8 JSON):
//!
//! ```json
//! { "ExternalId": "A-1", "Items": [ { "Name": "Widget", "Quantity": 2, "UnitPrice": 50.25 } ] }
//! ```
//!
//! Property names are matched case-insensitively when reading, and the item
//! list may be called `Items` or `Products`. Writing always uses the
//! `PascalCase` names above.
//!
//! `UnitPrice` is written as a JSON number carrying the exact decimal digits
//! and read back without passing through `f64`.

use crate::order::LineItem;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while reading, validating or writing a submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    /// The body is not JSON or does not have the submission shape.
    #[error("malformed submission: {0}")]
    Malformed(String),

    /// `ExternalId` is absent, empty or whitespace.
    #[error("ExternalId is required")]
    MissingExternalId,

    /// A line item carries a negative unit price.
    #[error("item {index} has a negative unit price")]
    NegativeUnitPrice {
        /// Position of the offending item.
        index: usize,
    },

    /// The submission could not be encoded.
    #[error("failed to serialize submission: {0}")]
    Serialization(String),
}

/// One line of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubmissionItem {
    /// Product name.
    pub name: String,
    /// Units ordered.
    pub quantity: u32,
    /// Price per unit.
    #[serde(serialize_with = "rust_decimal::serde::arbitrary_precision::serialize")]
    pub unit_price: Decimal,
}

impl SubmissionItem {
    /// Creates a submission line.
    #[must_use]
    pub fn new(name: impl Into<String>, quantity: u32, unit_price: Decimal) -> Self {
        Self {
            name: name.into(),
            quantity,
            unit_price,
        }
    }
}

/// An order as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderSubmission {
    /// Business key. May be blank until [`validate`](Self::validate) is called.
    pub external_id: String,
    /// Lines in submission order.
    pub items: Vec<SubmissionItem>,
}

#[derive(Deserialize)]
struct WireSubmission {
    #[serde(rename = "externalid", default)]
    external_id: Option<String>,
    #[serde(alias = "products", default)]
    items: Option<Vec<WireItem>>,
}

#[derive(Deserialize)]
struct WireItem {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    quantity: u32,
    #[serde(
        rename = "unitprice",
        default,
        deserialize_with = "rust_decimal::serde::arbitrary_precision::deserialize"
    )]
    unit_price: Decimal,
}

/// Lower-cases every object key, recursively.
///
/// If two keys collide after folding, the one iterated last wins.
fn fold_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key.to_lowercase(), fold_keys(value)))
                .collect(),
        ),
        Value::Array(values) => Value::Array(values.into_iter().map(fold_keys).collect()),
        other => other,
    }
}

impl OrderSubmission {
    /// Creates a submission.
    #[must_use]
    pub fn new(external_id: impl Into<String>, items: Vec<SubmissionItem>) -> Self {
        Self {
            external_id: external_id.into(),
            items,
        }
    }

    /// Reads a submission from a JSON body.
    ///
    /// Only the shape is checked here. An absent `ExternalId` becomes an empty
    /// string and an absent or `null` item list becomes empty, so that
    /// [`validate`](Self::validate) can report them precisely.
    ///
    /// # Errors
    ///
    /// Returns [`SubmissionError::Malformed`] if the body is not JSON or has
    /// the wrong shape.
    pub fn from_json(body: &[u8]) -> Result<Self, SubmissionError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| SubmissionError::Malformed(e.to_string()))?;
        let wire: WireSubmission = serde_json::from_value(fold_keys(value))
            .map_err(|e| SubmissionError::Malformed(e.to_string()))?;

        Ok(Self {
            external_id: wire.external_id.unwrap_or_default(),
            items: wire
                .items
                .unwrap_or_default()
                .into_iter()
                .map(|item| SubmissionItem {
                    name: item.name.unwrap_or_default(),
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                })
                .collect(),
        })
    }

    /// Checks the business key and item prices.
    ///
    /// An empty item list is valid and yields a zero total.
    ///
    /// # Errors
    ///
    /// [`SubmissionError::MissingExternalId`] for a blank key,
    /// [`SubmissionError::NegativeUnitPrice`] for a negative price.
    pub fn validate(&self) -> Result<(), SubmissionError> {
        if self.external_id.trim().is_empty() {
            return Err(SubmissionError::MissingExternalId);
        }
        if let Some(index) = self
            .items
            .iter()
            .position(|item| item.unit_price < Decimal::ZERO)
        {
            return Err(SubmissionError::NegativeUnitPrice { index });
        }
        Ok(())
    }

    /// Encodes the submission for publishing.
    ///
    /// # Errors
    ///
    /// Returns [`SubmissionError::Serialization`] if encoding fails.
    pub fn to_json(&self) -> Result<Vec<u8>, SubmissionError> {
        serde_json::to_vec(self).map_err(|e| SubmissionError::Serialization(e.to_string()))
    }

    /// Maps the submission lines to order line items.
    #[must_use]
    pub fn line_items(&self) -> Vec<LineItem> {
        self.items
            .iter()
            .map(|item| LineItem::new(item.name.clone(), item.quantity, item.unit_price))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn reads_pascal_case_body() {
        let body = br#"{"ExternalId":"E2E-1","Items":[{"Name":"Widget","Quantity":2,"UnitPrice":50.25}]}"#;
        let submission = OrderSubmission::from_json(body).unwrap();

        assert_eq!(submission.external_id, "E2E-1");
        assert_eq!(
            submission.items,
            vec![SubmissionItem::new("Widget", 2, Decimal::new(5025, 2))]
        );
    }

    #[test]
    fn property_names_are_case_insensitive() {
        let body = br#"{"externalID":"A","PRODUCTS":[{"name":"x","QUANTITY":1,"unitprice":"1.10"}]}"#;
        let submission = OrderSubmission::from_json(body).unwrap();

        assert_eq!(submission.external_id, "A");
        assert_eq!(submission.items[0].quantity, 1);
        assert_eq!(submission.items[0].unit_price, Decimal::new(110, 2));
    }

    #[test]
    fn absent_fields_become_empty() {
        let submission = OrderSubmission::from_json(br#"{"Items":null}"#).unwrap();
        assert_eq!(submission.external_id, "");
        assert!(submission.items.is_empty());
        assert_eq!(submission.validate(), Err(SubmissionError::MissingExternalId));
    }

    #[test]
    fn unparseable_bodies_are_malformed() {
        for body in [
            &b"not json"[..],
            br#"[1,2,3]"#,
            br#"{"ExternalId":42}"#,
            br#"{"ExternalId":"A","Items":[{"Quantity":-1}]}"#,
            br#"{"ExternalId":"A","Items":"none"}"#,
        ] {
            assert!(
                matches!(OrderSubmission::from_json(body), Err(SubmissionError::Malformed(_))),
                "expected malformed for {}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn blank_key_fails_validation() {
        let submission = OrderSubmission::new("   ", vec![]);
        assert_eq!(submission.validate(), Err(SubmissionError::MissingExternalId));
    }

    #[test]
    fn empty_items_pass_validation() {
        assert!(OrderSubmission::new("A", vec![]).validate().is_ok());
    }

    #[test]
    fn negative_price_fails_validation() {
        let submission = OrderSubmission::new(
            "A",
            vec![
                SubmissionItem::new("ok", 1, Decimal::ONE),
                SubmissionItem::new("bad", 1, Decimal::new(-1, 2)),
            ],
        );
        assert_eq!(
            submission.validate(),
            Err(SubmissionError::NegativeUnitPrice { index: 1 })
        );
    }

    #[test]
    fn writes_pascal_case_with_numeric_price() {
        let submission = OrderSubmission::new(
            "A-1",
            vec![SubmissionItem::new("Widget", 2, Decimal::new(5025, 2))],
        );
        let json: Value = serde_json::from_slice(&submission.to_json().unwrap()).unwrap();

        assert_eq!(json["ExternalId"], "A-1");
        assert_eq!(json["Items"][0]["Name"], "Widget");
        assert_eq!(json["Items"][0]["Quantity"], 2);
        assert_eq!(json["Items"][0]["UnitPrice"], 50.25);
    }

    #[test]
    fn written_body_reads_back_exactly() {
        let submission = OrderSubmission::new(
            "A-1",
            vec![
                SubmissionItem::new("a", 3, Decimal::new(1099, 2)),
                SubmissionItem::new("b", 1, Decimal::new(1, 1)),
            ],
        );
        let read = OrderSubmission::from_json(&submission.to_json().unwrap()).unwrap();
        assert_eq!(read, submission);
    }

    #[test]
    fn long_price_survives_the_queue_exactly() {
        let price: Decimal = "0.1234567890123456789".parse().unwrap();
        let submission =
            OrderSubmission::new("EXACT-1", vec![SubmissionItem::new("precise", 3, price)]);

        let body = submission.to_json().unwrap();
        assert!(
            String::from_utf8_lossy(&body).contains(r#""UnitPrice":0.1234567890123456789"#),
            "{}",
            String::from_utf8_lossy(&body)
        );
        let read = OrderSubmission::from_json(&body).unwrap();
        assert_eq!(read.items[0].unit_price, price);
        assert_eq!(read.items[0].unit_price.to_string(), "0.1234567890123456789");
    }

    #[test]
    fn long_numeric_literal_is_read_digit_for_digit() {
        let body = br#"{"externalid":"EXACT-2","items":[{"name":"x","quantity":1,"UNITPRICE":12345678901234567.89}]}"#;
        let submission = OrderSubmission::from_json(body).unwrap();

        assert_eq!(
            submission.items[0].unit_price,
            "12345678901234567.89".parse::<Decimal>().unwrap()
        );
    }

    #[test]
    fn trailing_zeros_keep_their_scale() {
        let body = br#"{"ExternalId":"S","Items":[{"Name":"x","Quantity":1,"UnitPrice":1.10}]}"#;
        let submission = OrderSubmission::from_json(body).unwrap();

        assert_eq!(submission.items[0].unit_price.to_string(), "1.10");
    }

    #[test]
    fn line_items_keep_order() {
        let submission = OrderSubmission::new(
            "A",
            vec![
                SubmissionItem::new("first", 1, Decimal::ONE),
                SubmissionItem::new("second", 2, Decimal::TWO),
            ],
        );
        let names: Vec<_> = submission.line_items().into_iter().map(|i| i.name).collect();
        assert_eq!(names, ["first", "second"]);
    }
}

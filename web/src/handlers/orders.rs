//! Order endpoints: submit, read, list, and synthetic load.

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json,
    body::Bytes,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use order_ingest_core::{
    Decimal, LineItem, OrderQuery, OrderRecord, OrderStatus, Page, store::MAX_PAGE_SIZE,
};
use order_ingest_runtime::TestOrderBatch;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Returned when a submission is accepted.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    /// Human-readable confirmation
    pub message: &'static str,
    /// Business key of the accepted order
    pub external_id: String,
    /// Always `RECEIVED`
    pub status: OrderStatus,
}

/// `POST /orders`
///
/// Returns 202 once the order is queued; persistence happens later.
///
/// # Errors
///
/// 400 for a malformed body or a blank `externalId`, 500 if the queue did not
/// take the message.
pub async fn submit_order(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let receipt = state.producer.submit_json(&body).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            message: "Order received for processing",
            external_id: receipt.external_id,
            status: receipt.status,
        }),
    ))
}

/// One line of an [`OrderResponse`].
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemResponse {
    /// Product name
    pub name: String,
    /// Units ordered
    pub quantity: u32,
    /// Price per unit
    pub unit_price: Decimal,
    /// `quantity * unit_price`
    pub total: Option<Decimal>,
}

impl From<&LineItem> for OrderItemResponse {
    fn from(item: &LineItem) -> Self {
        Self {
            name: item.name.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            total: item.total(),
        }
    }
}

/// A stored order. Decimals are serialized as strings.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    /// Business key
    pub external_id: String,
    /// Sum of the line totals
    pub total_value: Decimal,
    /// Lifecycle status
    pub status: OrderStatus,
    /// When the consumer picked the order up
    pub created_at: DateTime<Utc>,
    /// Lines in submission order
    pub items: Vec<OrderItemResponse>,
}

impl From<OrderRecord> for OrderResponse {
    fn from(record: OrderRecord) -> Self {
        Self {
            external_id: record.external_id().to_string(),
            total_value: record.total_value(),
            status: record.status(),
            created_at: record.created_at(),
            items: record.items().iter().map(OrderItemResponse::from).collect(),
        }
    }
}

/// `GET /orders/:external_id`
///
/// # Errors
///
/// 404 if no order has this key; 503 if the store is unavailable.
pub async fn get_order(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<Json<OrderResponse>, AppError> {
    let record = state
        .store
        .find_by_external_id(&external_id)
        .await?
        .ok_or_else(|| AppError::not_found("Order", &external_id))?;
    Ok(Json(record.into()))
}

/// Query string of `GET /orders`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    /// 1-based page, default 1
    pub page: Option<u32>,
    /// Page size, 1 to 100, default 20
    pub page_size: Option<u32>,
    /// Inclusive lower bound: an RFC 3339 instant or a date (start of day UTC)
    pub start_date: Option<String>,
    /// Inclusive upper bound: a date, covering the whole UTC day
    pub end_date: Option<String>,
    /// Status name, case-insensitive
    pub status: Option<String>,
}

/// A page of results.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResult<T> {
    /// Matching items over all pages
    pub total_items: u64,
    /// 1-based page number
    pub page: u32,
    /// Requested page size
    pub page_size: u32,
    /// Items on this page
    pub data: Vec<T>,
}

impl<T> From<Page<T>> for PagedResult<T> {
    fn from(page: Page<T>) -> Self {
        Self {
            total_items: page.total_items,
            page: page.page,
            page_size: page.page_size,
            data: page.data,
        }
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|instant| instant.with_timezone(&Utc).date_naive())
        })
}

fn parse_start(value: &str) -> Result<DateTime<Utc>, AppError> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
        .map_err(|_| AppError::bad_request(format!("invalid startDate: {value}")))
}

/// First instant after the UTC day of `value`.
fn parse_end(value: &str) -> Result<DateTime<Utc>, AppError> {
    parse_date(value)
        .and_then(|date| date.checked_add_days(Days::new(1)))
        .map(|next| next.and_time(NaiveTime::MIN).and_utc())
        .ok_or_else(|| AppError::bad_request(format!("invalid endDate: {value}")))
}

impl ListParams {
    /// Validates and converts to a store query.
    ///
    /// # Errors
    ///
    /// 400 for an out-of-range page or page size, an unparsable date, or an
    /// unknown status.
    pub fn into_query(self) -> Result<OrderQuery, AppError> {
        let defaults = OrderQuery::default();
        let page = self.page.unwrap_or(defaults.page);
        if page == 0 {
            return Err(AppError::bad_request("page must be at least 1"));
        }
        let page_size = self.page_size.unwrap_or(defaults.page_size);
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(AppError::bad_request(format!(
                "pageSize must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        let status = self
            .status
            .as_deref()
            .map(str::parse::<OrderStatus>)
            .transpose()
            .map_err(|e| AppError::bad_request(e.to_string()))?;

        Ok(OrderQuery {
            page,
            page_size,
            created_from: self.start_date.as_deref().map(parse_start).transpose()?,
            created_before: self.end_date.as_deref().map(parse_end).transpose()?,
            status,
        })
    }
}

/// `GET /orders?page=&pageSize=&startDate=&endDate=&status=`
///
/// Newest first.
///
/// # Errors
///
/// 400 for invalid parameters; 503 if the store is unavailable.
pub async fn list_orders(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<PagedResult<OrderResponse>>, AppError> {
    let Query(params) = params.map_err(|e| AppError::bad_request(e.body_text()))?;
    let query = params.into_query()?;
    let page = state.store.list(query).await?;
    Ok(Json(page.map(OrderResponse::from).into()))
}

const fn one() -> u32 {
    1
}

/// Body of `POST /orders/generate-test-orders`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    /// Orders to publish, 1 to 1,000,000
    pub count: u64,
    /// Drives the number of lines per order
    #[serde(default = "one")]
    pub products_per_order: u32,
    /// Pause between publishes
    #[serde(default)]
    pub delay_ms: u64,
}

/// Returned when a generation batch starts.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    /// Human-readable confirmation
    pub message: String,
    /// Orders that will be published
    pub count: u32,
}

/// `POST /orders/generate-test-orders`
///
/// Starts a background task publishing random orders and returns at once.
///
/// # Errors
///
/// 400 for a malformed body or a count outside `1..=1_000_000`.
pub async fn generate_test_orders(
    State(state): State<AppState>,
    request: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<GenerateResponse>), AppError> {
    let Json(request) = request.map_err(|e| AppError::bad_request(e.body_text()))?;
    let batch = TestOrderBatch::new(
        request.count,
        request.products_per_order,
        Duration::from_millis(request.delay_ms),
    )?;

    let producer = state.producer.clone();
    tokio::spawn(async move {
        producer.generate_test_orders(batch).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(GenerateResponse {
            message: format!("Generating {} test orders", batch.count()),
            count: batch.count(),
        }),
    ))
}

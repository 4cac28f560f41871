//! Persistence boundary for Order Records.
//!
//! The store is the arbiter of idempotency: it must enforce a uniqueness
//! constraint on `external_id`, so that of two concurrent inserts with the same
//! key exactly one succeeds and the other fails with
//! [`StoreError::DuplicateKey`]. The consumer's existence check is only a fast
//! path in front of that constraint.
//!
//! # Implementations
//!
//! - `PostgresOrderStore` in `order-ingest-postgres`
//! - `InMemoryOrderStore` in `order-ingest-testing`

use crate::order::{OrderRecord, OrderStatus};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Largest page size the read API hands out.
pub const MAX_PAGE_SIZE: u32 = 100;
/// Page size used when none is requested.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Errors that can occur during store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A record with this business key already exists.
    #[error("Duplicate external id: {0}")]
    DuplicateKey(String),

    /// The store could not be reached (pool exhausted, connection refused, I/O).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The database rejected the operation.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored row could not be mapped back to a record.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Failures worth retrying after a pause.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Filter and page selection for [`OrderStore::list`].
///
/// Results are ordered by `created_at` descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderQuery {
    /// 1-based page number.
    pub page: u32,
    /// Records per page.
    pub page_size: u32,
    /// Inclusive lower bound on `created_at`.
    pub created_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub created_before: Option<DateTime<Utc>>,
    /// Only records in this status.
    pub status: Option<OrderStatus>,
}

impl Default for OrderQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            created_from: None,
            created_before: None,
            status: None,
        }
    }
}

impl OrderQuery {
    /// Number of records to skip.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    /// Whether `record` passes the filters (not the paging).
    #[must_use]
    pub fn matches(&self, record: &OrderRecord) -> bool {
        self.created_from.is_none_or(|from| record.created_at() >= from)
            && self
                .created_before
                .is_none_or(|before| record.created_at() < before)
            && self.status.is_none_or(|status| record.status() == status)
    }
}

/// One page of results plus the total number of matching records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Matching records across all pages.
    pub total_items: u64,
    /// 1-based page number.
    pub page: u32,
    /// Requested page size.
    pub page_size: u32,
    /// Records on this page.
    pub data: Vec<T>,
}

impl<T> Page<T> {
    /// Converts the records, keeping the paging information.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            total_items: self.total_items,
            page: self.page,
            page_size: self.page_size,
            data: self.data.into_iter().map(f).collect(),
        }
    }
}

/// Uniqueness-constrained storage for [`OrderRecord`]s.
///
/// Each call acquires its own connection for its own duration; nothing is
/// shared between concurrently processed messages.
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns allow `Arc<dyn OrderStore>`.
pub trait OrderStore: Send + Sync {
    /// Whether a record with this business key exists.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] or [`StoreError::Database`].
    fn exists<'a>(
        &'a self,
        external_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>>;

    /// Inserts the record and its line items atomically.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateKey`] if the business key is taken; nothing is
    /// written in that case.
    fn insert<'a>(
        &'a self,
        record: &'a OrderRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    /// Loads a record with its items.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`], [`StoreError::Database`] or
    /// [`StoreError::Corrupt`].
    fn find_by_external_id<'a>(
        &'a self,
        external_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OrderRecord>, StoreError>> + Send + 'a>>;

    /// Lists records matching `query`, newest first.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`], [`StoreError::Database`] or
    /// [`StoreError::Corrupt`].
    fn list(
        &self,
        query: OrderQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Page<OrderRecord>, StoreError>> + Send + '_>>;

    /// Cheap round trip used by readiness checks.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the store does not answer.
    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;
}

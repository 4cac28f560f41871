//! In-memory order store for fast, deterministic tests.
//!
//! Enforces the same uniqueness constraint on `external_id` as the
//! `PostgreSQL` schema, atomically under a write lock, and lets tests inject
//! the failures the consumer has to survive:
//!
//! - [`InMemoryOrderStore::fail_next_inserts`]: transient commit failures
//! - [`InMemoryOrderStore::set_unavailable`]: every call fails
//! - [`InMemoryOrderStore::set_insert_delay`]: slow commits
//! - [`InMemoryOrderStore::set_stale_reads`]: `exists` always answers `false`,
//!   so only the constraint stands between two concurrent copies of a message

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only

use order_ingest_core::{OrderQuery, OrderRecord, OrderStore, Page, StoreError};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// `HashMap`-backed [`OrderStore`].
///
/// # Example
///
/// ```
/// use order_ingest_core::{OrderRecord, OrderStore};
/// use order_ingest_testing::{InMemoryOrderStore, test_clock};
/// use order_ingest_core::environment::Clock;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryOrderStore::new();
/// let record = OrderRecord::new("A-1", vec![], test_clock().now())?;
///
/// store.insert(&record).await?;
/// assert!(store.exists("A-1").await?);
/// assert!(store.insert(&record).await.is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryOrderStore {
    records: Arc<RwLock<HashMap<String, OrderRecord>>>,
    failing_inserts: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
    stale_reads: Arc<AtomicBool>,
    insert_delay: Arc<Mutex<Option<Duration>>>,
    insert_attempts: Arc<AtomicUsize>,
    duplicate_rejections: Arc<AtomicUsize>,
}

impl InMemoryOrderStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` inserts fail with [`StoreError::Unavailable`].
    pub fn fail_next_inserts(&self, n: usize) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    /// Make every operation fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `exists` always report `false`.
    pub fn set_stale_reads(&self, stale: bool) {
        self.stale_reads.store(stale, Ordering::SeqCst);
    }

    /// Sleep this long inside every insert, before the constraint check.
    pub fn set_insert_delay(&self, delay: Duration) {
        *self.insert_delay.lock().unwrap() = Some(delay);
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// Stored record for `external_id`, if any.
    #[must_use]
    pub fn get(&self, external_id: &str) -> Option<OrderRecord> {
        self.records.read().unwrap().get(external_id).cloned()
    }

    /// Inserts attempted so far, failed ones included.
    #[must_use]
    pub fn insert_attempts(&self) -> usize {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    /// Inserts refused by the uniqueness constraint.
    #[must_use]
    pub fn duplicate_rejections(&self) -> usize {
        self.duplicate_rejections.load(Ordering::SeqCst)
    }

    /// Puts a record in place without going through `insert`.
    pub fn seed(&self, record: OrderRecord) {
        self.records
            .write()
            .unwrap()
            .insert(record.external_id().to_string(), record);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl OrderStore for InMemoryOrderStore {
    fn exists<'a>(
        &'a self,
        external_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            if self.stale_reads.load(Ordering::SeqCst) {
                return Ok(false);
            }
            Ok(self.records.read().unwrap().contains_key(external_id))
        })
    }

    fn insert<'a>(
        &'a self,
        record: &'a OrderRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.insert_attempts.fetch_add(1, Ordering::SeqCst);
            self.check_available()?;

            let delay = *self.insert_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if self.take_injected_failure() {
                return Err(StoreError::Unavailable("injected insert failure".to_string()));
            }

            let mut records = self.records.write().unwrap();
            if records.contains_key(record.external_id()) {
                self.duplicate_rejections.fetch_add(1, Ordering::SeqCst);
                return Err(StoreError::DuplicateKey(record.external_id().to_string()));
            }
            records.insert(record.external_id().to_string(), record.clone());
            Ok(())
        })
    }

    fn find_by_external_id<'a>(
        &'a self,
        external_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OrderRecord>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.get(external_id))
        })
    }

    fn list(
        &self,
        query: OrderQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Page<OrderRecord>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;

            let mut matching: Vec<OrderRecord> = self
                .records
                .read()
                .unwrap()
                .values()
                .filter(|record| query.matches(record))
                .cloned()
                .collect();
            matching.sort_by_key(|record| (Reverse(record.created_at()), record.external_id().to_string()));

            let total_items = matching.len() as u64;
            let offset = usize::try_from(query.offset()).unwrap_or(usize::MAX);
            let data = matching
                .into_iter()
                .skip(offset)
                .take(query.page_size as usize)
                .collect();

            Ok(Page {
                total_items,
                page: query.page,
                page_size: query.page_size,
                data,
            })
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move { self.check_available() })
    }
}

//! `PostgreSQL` order store for the order ingestion pipeline.
//!
//! This crate provides [`PostgresOrderStore`], the production implementation
//! of the [`OrderStore`] trait from `order-ingest-core`. It uses sqlx with a
//! connection pool, so every call checks out its own connection for its own
//! duration.
//!
//! # Schema
//!
//! See `migrations/`. The `orders_external_id_key` unique constraint is the
//! idempotency guarantee: a second insert of the same business key fails with
//! a unique violation, reported as [`StoreError::DuplicateKey`].
//!
//! # Example
//!
//! ```no_run
//! use order_ingest_postgres::PostgresOrderStore;
//! use order_ingest_core::OrderStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresOrderStore::connect("postgres://localhost/orders", 10).await?;
//! store.migrate().await?;
//! let exists = store.exists("A-1").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use order_ingest_core::{
    LineItem, OrderQuery, OrderRecord, OrderStatus, OrderStore, Page, StoreError,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

/// How long a call waits for a pooled connection before failing as unavailable.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// `PostgreSQL`-backed [`OrderStore`].
#[derive(Clone, Debug)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Create a store using an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool of at most `max_connections` connections.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be reached.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_items(&self, order_ids: &[i64]) -> Result<HashMap<i64, Vec<LineItem>>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT order_id, name, quantity, unit_price
            FROM order_items
            WHERE order_id = ANY($1)
            ORDER BY order_id, position
            ",
        )
        .bind(order_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_error("load items", e))?;

        let mut items: HashMap<i64, Vec<LineItem>> = HashMap::new();
        for row in &rows {
            let order_id: i64 = row.try_get("order_id").map_err(|e| map_error("load items", e))?;
            items.entry(order_id).or_default().push(row_to_item(row)?);
        }
        Ok(items)
    }
}

/// Maps a sqlx error to the store taxonomy.
///
/// Connection-level failures are transient; decode failures mean a row does
/// not fit the domain model.
fn map_error(operation: &str, error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(format!("{operation}: {error}")),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_) => StoreError::Corrupt(format!("{operation}: {error}")),
        _ => StoreError::Database(format!("{operation}: {error}")),
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn row_to_item(row: &PgRow) -> Result<LineItem, StoreError> {
    let quantity: i64 = row.try_get("quantity").map_err(|e| map_error("decode item", e))?;
    Ok(LineItem {
        name: row.try_get("name").map_err(|e| map_error("decode item", e))?,
        quantity: u32::try_from(quantity)
            .map_err(|_| StoreError::Corrupt(format!("item quantity out of range: {quantity}")))?,
        unit_price: row
            .try_get::<Decimal, _>("unit_price")
            .map_err(|e| map_error("decode item", e))?,
    })
}

/// Decodes an `orders` row; items are attached by the caller.
fn row_to_record(row: &PgRow, items: Vec<LineItem>) -> Result<OrderRecord, StoreError> {
    let status: String = row.try_get("status").map_err(|e| map_error("decode order", e))?;
    let status: OrderStatus = status
        .parse()
        .map_err(|e| StoreError::Corrupt(format!("{e}")))?;
    let created_at: DateTime<Utc> = row
        .try_get("created_at")
        .map_err(|e| map_error("decode order", e))?;

    Ok(OrderRecord::restore(
        row.try_get("external_id")
            .map_err(|e| map_error("decode order", e))?,
        status,
        created_at,
        row.try_get("total_value")
            .map_err(|e| map_error("decode order", e))?,
        items,
    ))
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &OrderQuery) {
    builder.push(" WHERE TRUE");
    if let Some(from) = query.created_from {
        builder.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(before) = query.created_before {
        builder.push(" AND created_at < ").push_bind(before);
    }
    if let Some(status) = query.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
}

fn record_duration(operation: &'static str, started: Instant) {
    metrics::histogram!("order_store_query_duration_seconds", "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

impl OrderStore for PostgresOrderStore {
    fn exists<'a>(
        &'a self,
        external_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let started = Instant::now();
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM orders WHERE external_id = $1)")
                    .bind(external_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| map_error("exists", e))?;
            record_duration("exists", started);
            Ok(exists)
        })
    }

    fn insert<'a>(
        &'a self,
        record: &'a OrderRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let started = Instant::now();
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_error("begin", e))?;

            let order_id: i64 = sqlx::query_scalar(
                r"
                INSERT INTO orders (external_id, status, total_value, created_at)
                VALUES ($1, $2, $3, $4)
                RETURNING id
                ",
            )
            .bind(record.external_id())
            .bind(record.status().as_str())
            .bind(record.total_value())
            .bind(record.created_at())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateKey(record.external_id().to_string())
                } else {
                    map_error("insert order", e)
                }
            })?;

            for (position, item) in record.items().iter().enumerate() {
                let position = i32::try_from(position)
                    .map_err(|_| StoreError::Database("too many line items".to_string()))?;
                sqlx::query(
                    r"
                    INSERT INTO order_items (order_id, position, name, quantity, unit_price)
                    VALUES ($1, $2, $3, $4, $5)
                    ",
                )
                .bind(order_id)
                .bind(position)
                .bind(&item.name)
                .bind(i64::from(item.quantity))
                .bind(item.unit_price)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_error("insert item", e))?;
            }

            tx.commit().await.map_err(|e| map_error("commit", e))?;
            record_duration("insert", started);

            tracing::debug!(
                external_id = %record.external_id(),
                order_id = order_id,
                items = record.items().len(),
                "Order inserted"
            );
            Ok(())
        })
    }

    fn find_by_external_id<'a>(
        &'a self,
        external_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OrderRecord>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let started = Instant::now();
            let row = sqlx::query(
                r"
                SELECT id, external_id, status, total_value, created_at
                FROM orders
                WHERE external_id = $1
                ",
            )
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_error("find order", e))?;

            let Some(row) = row else {
                return Ok(None);
            };
            let order_id: i64 = row.try_get("id").map_err(|e| map_error("find order", e))?;
            let mut items = self.load_items(&[order_id]).await?;
            let record = row_to_record(&row, items.remove(&order_id).unwrap_or_default())?;

            record_duration("find", started);
            Ok(Some(record))
        })
    }

    fn list(
        &self,
        query: OrderQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Page<OrderRecord>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let started = Instant::now();

            let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM orders");
            push_filters(&mut count, &query);
            let total_items: i64 = count
                .build_query_scalar()
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_error("count orders", e))?;

            let mut select = QueryBuilder::<Postgres>::new(
                "SELECT id, external_id, status, total_value, created_at FROM orders",
            );
            push_filters(&mut select, &query);
            select
                .push(" ORDER BY created_at DESC, id DESC LIMIT ")
                .push_bind(i64::from(query.page_size))
                .push(" OFFSET ")
                .push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));
            let rows = select
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_error("list orders", e))?;

            let ids = rows
                .iter()
                .map(|row| row.try_get::<i64, _>("id"))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| map_error("list orders", e))?;
            let mut items = if ids.is_empty() {
                HashMap::new()
            } else {
                self.load_items(&ids).await?
            };

            let data = rows
                .iter()
                .zip(&ids)
                .map(|(row, id)| row_to_record(row, items.remove(id).unwrap_or_default()))
                .collect::<Result<Vec<_>, _>>()?;

            record_duration("list", started);
            Ok(Page {
                total_items: u64::try_from(total_items).unwrap_or_default(),
                page: query.page,
                page_size: query.page_size,
                data,
            })
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(|e| map_error("ping", e))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_transient() {
        assert!(map_error("x", sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_error("x", sqlx::Error::PoolClosed).is_transient());
        assert!(map_error("x", sqlx::Error::WorkerCrashed).is_transient());
    }

    #[test]
    fn decode_errors_are_corruption() {
        assert!(matches!(
            map_error("x", sqlx::Error::ColumnNotFound("status".to_string())),
            StoreError::Corrupt(_)
        ));
    }

    #[test]
    fn other_errors_are_database_errors() {
        let error = map_error("x", sqlx::Error::RowNotFound);
        assert!(matches!(error, StoreError::Database(_)));
        assert!(!error.is_transient());
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn filters_only_add_requested_clauses() {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM orders");
        push_filters(&mut builder, &OrderQuery::default());
        assert_eq!(builder.sql(), "SELECT COUNT(*) FROM orders WHERE TRUE");

        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM orders");
        push_filters(
            &mut builder,
            &OrderQuery {
                created_from: Some(Utc::now()),
                status: Some(OrderStatus::Calculated),
                ..OrderQuery::default()
            },
        );
        assert_eq!(
            builder.sql(),
            "SELECT COUNT(*) FROM orders WHERE TRUE AND created_at >= $1 AND status = $2"
        );
    }
}

//! Axum HTTP surface for the order ingestion pipeline.
//!
//! The handlers are a thin shell: submissions go straight to the
//! [`OrderProducer`](order_ingest_runtime::OrderProducer), reads go to the
//! [`OrderStore`](order_ingest_core::OrderStore). Nothing here touches the
//! consumer beyond watching its state for readiness.
//!
//! # Request Flow
//!
//! 1. **HTTP Request** arrives and gets a correlation ID
//! 2. **Extract data** from the request (body, path, query)
//! 3. **Call** the producer or the store
//! 4. **Map result** to an HTTP response, errors through [`AppError`]
//!
//! # Example
//!
//! ```ignore
//! let state = AppState::new(producer, store, consumer_state, metrics_handle);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, order_ingest_web::router(state)).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;

// Re-export key types for convenience
pub use error::AppError;
pub use middleware::{CORRELATION_ID_HEADER, CorrelationId, correlation_id};
pub use router::router;
pub use state::AppState;

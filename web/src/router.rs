//! HTTP router.
//!
//! Composes all handlers into a single Axum router.

use crate::handlers;
use crate::middleware::correlation_id;
use crate::state::AppState;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Create the service router with all endpoints.
///
/// # Routes
///
/// - `POST /orders` - Queue an order
/// - `GET /orders` - List stored orders, paged and filtered
/// - `GET /orders/:external_id` - Get a stored order
/// - `POST /orders/generate-test-orders` - Publish synthetic load
/// - `GET /health` - Liveness
/// - `GET /health/ready` - Readiness
/// - `GET /metrics` - Prometheus scrape
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/orders",
            post(handlers::submit_order).get(handlers::list_orders),
        )
        .route(
            "/orders/generate-test-orders",
            post(handlers::generate_test_orders),
        )
        .route("/orders/:external_id", get(handlers::get_order))
        .route("/health", get(handlers::health_check))
        .route("/health/ready", get(handlers::readiness))
        .route("/metrics", get(handlers::metrics::render))
        .layer(axum::middleware::from_fn(correlation_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

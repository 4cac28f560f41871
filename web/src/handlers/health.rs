//! Health check endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems
//! to verify service health.

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use order_ingest_runtime::ConsumerState;
use serde::Serialize;

/// Liveness body.
#[derive(Debug, Serialize)]
pub struct Liveness {
    /// Always `"ok"`
    pub status: &'static str,
}

/// Simple health check endpoint (for basic liveness).
///
/// Does NOT check dependencies.
///
/// # Endpoint
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> Json<Liveness> {
    Json(Liveness { status: "ok" })
}

/// Readiness body.
#[derive(Debug, Serialize)]
pub struct Readiness {
    /// `"ready"` or `"not_ready"`
    pub status: &'static str,
    /// `"up"` or `"down"`
    pub store: &'static str,
    /// Consumer state name
    pub consumer: &'static str,
}

/// Readiness: the store answers and the consumer is consuming.
///
/// # Status Codes
///
/// - 200 OK: ready
/// - 503 Service Unavailable: otherwise
///
/// # Endpoint
///
/// ```text
/// GET /health/ready
/// ```
///
/// # Response
///
/// ```json
/// { "status": "ready", "store": "up", "consumer": "CONSUMING" }
/// ```
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<Readiness>) {
    let store_up = match state.store.ping().await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(error = %error, "Readiness: store ping failed");
            false
        }
    };
    let consumer = *state.consumer.borrow();
    let ready = store_up && consumer == ConsumerState::Consuming;

    let body = Readiness {
        status: if ready { "ready" } else { "not_ready" },
        store: if store_up { "up" } else { "down" },
        consumer: consumer.as_str(),
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simple_health_check() {
        let Json(body) = health_check().await;
        assert_eq!(body.status, "ok");
    }
}

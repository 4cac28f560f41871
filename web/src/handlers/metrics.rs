//! Prometheus scrape endpoint.

use crate::state::AppState;
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
};

/// `GET /metrics` in the Prometheus text exposition format.
#[allow(clippy::unused_async)]
pub async fn render(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

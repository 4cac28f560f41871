//! Correlation IDs for request tracking.
//!
//! Every request gets a correlation ID, taken from the `X-Correlation-ID`
//! header when the caller sent a usable one and generated otherwise. The ID is
//! stored in the request extensions, recorded on the request span and echoed
//! back in the response header.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/orders", post(submit_order))
//!     .layer(axum::middleware::from_fn(correlation_id));
//! ```

use axum::{
    async_trait,
    extract::{FromRequestParts, Request},
    http::{HeaderValue, request::Parts},
    middleware::Next,
    response::Response,
};
use std::convert::Infallible;
use tracing::Instrument;
use uuid::Uuid;

/// Header name for correlation ID.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

const MAX_LEN: usize = 128;

/// Correlation ID of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Uses `value` if it is printable ASCII of reasonable length.
    fn from_header(value: Option<&HeaderValue>) -> Self {
        value
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty() && s.len() <= MAX_LEN)
            .filter(|s| s.chars().all(|c| c.is_ascii_graphic()))
            .map_or_else(|| Self(Uuid::new_v4().to_string()), |s| Self(s.to_string()))
    }
}

/// Middleware attaching a [`CorrelationId`] to each request and response.
pub async fn correlation_id(mut req: Request, next: Next) -> Response {
    let id = CorrelationId::from_header(req.headers().get(CORRELATION_ID_HEADER));
    req.extensions_mut().insert(id.clone());

    let span = tracing::info_span!(
        "http_request",
        correlation_id = %id.0,
        method = %req.method(),
        uri = %req.uri(),
    );

    let mut response = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&id.0) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

#[async_trait]
impl<S> FromRequestParts<S> for CorrelationId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Self>()
            .cloned()
            .unwrap_or_else(|| Self::from_header(parts.headers.get(CORRELATION_ID_HEADER))))
    }
}

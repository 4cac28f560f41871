//! Router tests against the in-memory broker and store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use chrono::{TimeZone, Utc};
use order_ingest_core::{Decimal, LineItem, OrderRecord};
use order_ingest_runtime::{ConsumerState, OrderProducer};
use order_ingest_testing::{InMemoryBroker, InMemoryOrderStore};
use order_ingest_web::{AppState, CORRELATION_ID_HEADER, router};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceExt;

struct Harness {
    broker: InMemoryBroker,
    store: InMemoryOrderStore,
    consumer: watch::Sender<ConsumerState>,
    app: Router,
}

fn harness() -> Harness {
    order_ingest_testing::init_tracing();
    let broker = InMemoryBroker::new();
    let store = InMemoryOrderStore::new();
    let (consumer, consumer_state) = watch::channel(ConsumerState::Disconnected);
    let metrics = order_ingest_runtime::metrics::builder()
        .unwrap()
        .build_recorder()
        .handle();

    let state = AppState::new(
        OrderProducer::new(Arc::new(broker.clone())),
        Arc::new(store.clone()),
        consumer_state,
        metrics,
    );
    Harness {
        broker,
        store,
        consumer,
        app: router(state),
    }
}

fn seed(store: &InMemoryOrderStore, external_id: &str, day: u32, calculate: bool) {
    let mut record = OrderRecord::new(
        external_id,
        vec![LineItem::new("Widget", 2, Decimal::new(5025, 2))],
        Utc.with_ymd_and_hms(2025, 6, day, 12, 0, 0).unwrap(),
    )
    .unwrap();
    if calculate {
        record.calculate().unwrap();
    }
    store.seed(record);
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn get(app: &Router, uri: &str) -> Response {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn post_json(app: &Router, uri: &str, body: &str) -> Response {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn submit_queues_order_and_returns_accepted() {
    let h = harness();

    let response = post_json(
        &h.app,
        "/orders",
        r#"{"ExternalId":"A-1","Items":[{"Name":"Widget","Quantity":2,"UnitPrice":50.25}]}"#,
    )
    .await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(response.headers().contains_key(CORRELATION_ID_HEADER));
    let body = json_body(response).await;
    assert_eq!(body["externalId"], "A-1");
    assert_eq!(body["status"], "RECEIVED");

    assert_eq!(h.broker.stats().ready, 1);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn submit_rejects_invalid_bodies_without_publishing() {
    let h = harness();

    for body in [
        r#"{"ExternalId":"","Items":[]}"#,
        r#"{"Items":[]}"#,
        "not json",
    ] {
        let response = post_json(&h.app, "/orders", body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        assert_eq!(json_body(response).await["code"], "INVALID_ORDER");
    }

    assert_eq!(h.broker.stats().published, 0);
}

#[tokio::test]
async fn submit_reports_queue_failure() {
    let h = harness();
    h.broker.set_unreachable(true);

    let response = post_json(&h.app, "/orders", r#"{"ExternalId":"A-2","Items":[]}"#).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["code"], "QUEUE_UNAVAILABLE");
}

#[tokio::test]
async fn get_order_returns_exact_totals() {
    let h = harness();
    seed(&h.store, "A-1", 1, true);

    let response = get(&h.app, "/orders/A-1").await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["externalId"], "A-1");
    assert_eq!(body["totalValue"], "100.50");
    assert_eq!(body["status"], "CALCULATED");
    assert_eq!(body["items"][0]["name"], "Widget");
    assert_eq!(body["items"][0]["quantity"], 2);
}

#[tokio::test]
async fn get_unknown_order_is_not_found() {
    let h = harness();

    let response = get(&h.app, "/orders/missing").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn get_order_with_store_down_is_unavailable() {
    let h = harness();
    h.store.set_unavailable(true);

    let response = get(&h.app, "/orders/A-1").await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn list_pages_newest_first() {
    let h = harness();
    for day in 1..=5 {
        seed(&h.store, &format!("L-{day}"), day, true);
    }

    let response = get(&h.app, "/orders?page=2&pageSize=2").await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["totalItems"], 5);
    assert_eq!(body["page"], 2);
    assert_eq!(body["pageSize"], 2);
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|order| order["externalId"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["L-3", "L-2"]);
}

#[tokio::test]
async fn list_filters_by_date_and_status() {
    let h = harness();
    seed(&h.store, "D-1", 1, true);
    seed(&h.store, "D-2", 2, true);
    seed(&h.store, "D-3", 3, false);
    seed(&h.store, "D-4", 4, true);

    let body = json_body(get(&h.app, "/orders?startDate=2025-06-02&endDate=2025-06-03").await).await;
    assert_eq!(body["totalItems"], 2);

    let body = json_body(
        get(
            &h.app,
            "/orders?startDate=2025-06-02&endDate=2025-06-03&status=calculated",
        )
        .await,
    )
    .await;
    assert_eq!(body["totalItems"], 1);
    assert_eq!(body["data"][0]["externalId"], "D-2");
}

#[tokio::test]
async fn list_rejects_invalid_parameters() {
    let h = harness();

    for uri in [
        "/orders?page=0",
        "/orders?pageSize=500",
        "/orders?page=abc",
        "/orders?status=SHIPPED",
        "/orders?startDate=yesterday",
    ] {
        let response = get(&h.app, uri).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "uri: {uri}");
    }
}

#[tokio::test]
async fn generate_publishes_in_background() {
    let h = harness();

    let response = post_json(
        &h.app,
        "/orders/generate-test-orders",
        &json!({ "count": 3, "productsPerOrder": 2 }).to_string(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(json_body(response).await["count"], 3);
    assert!(
        h.broker
            .wait_until(Duration::from_secs(5), |stats| stats.published == 3)
            .await
    );
}

#[tokio::test]
async fn generate_rejects_out_of_range_counts() {
    let h = harness();

    for body in [
        json!({ "count": 0 }).to_string(),
        json!({ "count": 1_000_001 }).to_string(),
        "{}".to_string(),
    ] {
        let response = post_json(&h.app, "/orders/generate-test-orders", &body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
    }
    assert_eq!(h.broker.stats().published, 0);
}

#[tokio::test]
async fn liveness_is_always_ok() {
    let h = harness();
    h.store.set_unavailable(true);

    let response = get(&h.app, "/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ok");
}

#[tokio::test]
async fn readiness_follows_store_and_consumer() {
    let h = harness();

    let response = get(&h.app, "/health/ready").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["consumer"], "DISCONNECTED");

    h.consumer.send(ConsumerState::Consuming).unwrap();
    let response = get(&h.app, "/health/ready").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ready");

    h.store.set_unavailable(true);
    let response = get(&h.app, "/health/ready").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["store"], "down");
}

#[tokio::test]
async fn metrics_endpoint_renders_text() {
    let h = harness();

    let response = get(&h.app, "/metrics").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
}

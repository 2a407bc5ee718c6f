use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use inventory_service::api::{create_router, AppState};
use inventory_service::engine::{EngineConfig, InventoryEngine};
use inventory_service::metrics::ConsumerMetrics;
use inventory_service::models::NewInventory;
use inventory_service::store::MemoryInventoryStore;
use inventory_service::validation::ValidationChain;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app(records: &[(&str, i32)]) -> Router {
    let store = MemoryInventoryStore::seeded(
        records
            .iter()
            .map(|(id, total)| NewInventory::new(*id, *total))
            .collect(),
    );
    create_router(AppState {
        engine: Arc::new(InventoryEngine::new(store, EngineConfig::default())),
        chain: Arc::new(ValidationChain::default()),
        metrics: Arc::new(ConsumerMetrics::new()),
    })
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&value).unwrap())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn validate_reports_every_failing_item() {
    let app = app(&[("P1", 10), ("P2", 1)]);

    let (status, body) = call(
        &app,
        Method::POST,
        "/inventory/validate",
        Some(json!([
            { "productId": "P1", "quantity": 2 },
            { "productId": "P2", "quantity": 5 },
            { "productId": "P3", "quantity": 1 }
        ])),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(false));
    let invalid = body["invalidItems"].as_array().unwrap();
    assert_eq!(invalid.len(), 2);
    assert_eq!(invalid[0]["item"]["productId"], json!("P2"));
    assert_eq!(
        invalid[0]["reasons"][0],
        json!("Insufficient stock for product P2: requested 5, available 1")
    );
    assert_eq!(invalid[1]["reasons"][0], json!("Product P3 not found in inventory"));
}

#[tokio::test]
async fn validate_passes_without_reserving() {
    let app = app(&[("P1", 3)]);

    let (status, body) = call(
        &app,
        Method::POST,
        "/inventory/validate",
        Some(json!([{ "productId": "P1", "quantity": 3 }])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));

    let (_, record) = call(&app, Method::GET, "/inventory/P1", None).await;
    assert_eq!(record["reservedQuantity"], json!(0));
    assert_eq!(record["availableQuantity"], json!(3));
}

#[tokio::test]
async fn empty_validation_is_a_bad_request() {
    let app = app(&[]);

    let (status, body) = call(&app, Method::POST, "/inventory/validate", Some(json!([]))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("INVALID_REQUEST"));
}

#[tokio::test]
async fn reserve_endpoint_returns_per_item_outcomes() {
    let app = app(&[("P1", 10), ("P2", 5)]);

    let (status, body) = call(
        &app,
        Method::POST,
        "/inventory/reserve",
        Some(json!({
            "userId": "user-1",
            "items": [
                { "productId": "P1", "quantity": 3 },
                { "productId": "P2", "quantity": 1000 }
            ]
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["overallSuccess"], json!(false));
    assert_eq!(body["perItem"][0]["reason"], json!("BATCH_ROLLED_BACK"));
    assert_eq!(body["perItem"][1]["reason"], json!("INSUFFICIENT_STOCK"));
    assert_eq!(body["perItem"][1]["currentStock"], json!(5));
}

#[tokio::test]
async fn onboarding_and_decommissioning_lifecycle() {
    let app = app(&[]);

    let (status, created) = call(
        &app,
        Method::POST,
        "/inventory",
        Some(json!([{ "productId": "NEW", "totalQuantity": 4 }])),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created[0]["status"], json!("IN_STOCK"));

    let (status, _) = call(
        &app,
        Method::POST,
        "/inventory",
        Some(json!([{ "productId": "NEW", "totalQuantity": 1 }])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    call(
        &app,
        Method::POST,
        "/inventory/reserve",
        Some(json!({ "userId": "u", "items": [{ "productId": "NEW", "quantity": 1 }] })),
    )
    .await;
    let (status, body) = call(&app, Method::DELETE, "/inventory/NEW", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], json!("OUTSTANDING_RESERVATIONS"));

    let (status, _) = call(&app, Method::GET, "/inventory/MISSING", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reports_consumer_counters() {
    let app = app(&[]);

    let (status, body) = call(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));
    assert!(body["consumer"]["counters"].is_object());
}

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use cart_service::api::{create_router, AppState};
use cart_service::cart::CartService;
use cart_service::outbox::{OutboxAdmin, OutboxRelay, RelayConfig};
use cart_service::store::MemoryCartStore;
use common::{RecordingPublisher, StubValidator};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    store: MemoryCartStore,
    publisher: Arc<RecordingPublisher>,
}

impl TestApp {
    fn new(validator: StubValidator) -> Self {
        let store = MemoryCartStore::new();
        let publisher = Arc::new(RecordingPublisher::new());
        let router = create_router(AppState {
            cart: Arc::new(CartService::new(store.clone(), Arc::new(validator))),
            admin: Arc::new(OutboxAdmin::new(store.clone(), Arc::clone(&publisher))),
        });
        Self {
            router,
            store,
            publisher,
        }
    }

    async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => Body::empty(),
        };
        let response = self
            .router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }
}

#[tokio::test]
async fn cart_lifecycle_over_http() {
    let app = TestApp::new(StubValidator::accepting());

    let (status, item) = app
        .call(
            Method::POST,
            "/carts/user-1/items",
            Some(json!({ "productId": "P1", "quantity": 2, "price": 4.5 })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(item["productId"], json!("P1"));
    assert_eq!(item["quantity"], json!(2));

    let (status, cart) = app.call(Method::GET, "/carts/user-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cart.as_array().unwrap().len(), 1);

    let (status, receipt) = app.call(Method::POST, "/carts/user-1/checkout", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(receipt["orderId"].is_string());

    let (status, body) = app.call(Method::POST, "/carts/user-1/checkout", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("INVALID_REQUEST"));

    assert_eq!(app.store.outbox_events().await.len(), 2);
}

#[tokio::test]
async fn stock_rejection_maps_to_conflict() {
    let app = TestApp::new(StubValidator::rejecting("P1"));

    let (status, body) = app
        .call(
            Method::POST,
            "/carts/user-1/items",
            Some(json!({ "productId": "P1", "quantity": 9 })),
        )
        .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], json!("INSUFFICIENT_STOCK"));
    assert!(app.store.outbox_events().await.is_empty());
}

#[tokio::test]
async fn unavailable_inventory_maps_to_service_unavailable() {
    let app = TestApp::new(StubValidator::unavailable());

    let (status, _) = app
        .call(
            Method::POST,
            "/carts/user-1/items",
            Some(json!({ "productId": "P1", "quantity": 1 })),
        )
        .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn removing_a_missing_line_is_not_found() {
    let app = TestApp::new(StubValidator::accepting());

    let (status, body) = app.call(Method::DELETE, "/carts/user-1/items/P1", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], json!("NOT_FOUND"));
}

#[tokio::test]
async fn failed_events_can_be_listed_retried_and_deleted() {
    let app = TestApp::new(StubValidator::accepting());
    app.call(
        Method::POST,
        "/carts/user-1/items",
        Some(json!({ "productId": "P1", "quantity": 1 })),
    )
    .await;

    let (status, _) = app.call(Method::DELETE, "/admin/outbox/1", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    app.publisher.fail(true);
    let relay = OutboxRelay::new(app.store.clone(), Arc::clone(&app.publisher), RelayConfig::default());
    relay.relay_once().await.unwrap();

    let (status, failed) = app.call(Method::GET, "/admin/outbox/failed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(failed[0]["id"], json!(1));
    assert_eq!(failed[0]["status"], json!("FAILED"));
    assert_eq!(failed[0]["error"], json!("broker error: broker down"));

    app.publisher.fail(false);
    let (status, retried) = app.call(Method::POST, "/admin/outbox/1/retry", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(retried["status"], json!("SENT"));
    assert_eq!(retried["error"], Value::Null);

    let (status, _) = app.call(Method::POST, "/admin/outbox/1/retry", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app.call(Method::DELETE, "/admin/outbox/1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app.call(Method::POST, "/admin/outbox/1/retry", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

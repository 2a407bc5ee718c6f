use async_trait::async_trait;
use inventory_service::consumer::{EventState, InventoryEventConsumer};
use inventory_service::engine::{EngineConfig, InventoryEngine};
use inventory_service::error::InventoryError;
use inventory_service::handlers::{EventHandler, EventRouter, HandlerOutcome, InventoryEvent, Topics};
use inventory_service::metrics::ConsumerMetrics;
use inventory_service::models::NewInventory;
use inventory_service::store::{InventoryStore, InventoryTx, MemoryInventoryStore};
use serde_json::json;
use shared::{RELEASE_TOPIC, REPLENISH_TOPIC, RESERVE_TOPIC};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    engine: Arc<InventoryEngine<MemoryInventoryStore>>,
    consumer: InventoryEventConsumer,
}

impl Harness {
    fn new(store: MemoryInventoryStore) -> Self {
        let engine = Arc::new(InventoryEngine::new(store, EngineConfig::default()));
        let router = EventRouter::for_engine(Arc::clone(&engine), &Topics::default());
        let consumer = InventoryEventConsumer::new(router, Arc::new(ConsumerMetrics::new()));
        Self { engine, consumer }
    }

    fn seeded(records: &[(&str, i32)]) -> Self {
        Self::new(MemoryInventoryStore::seeded(
            records
                .iter()
                .map(|(id, total)| NewInventory::new(*id, *total))
                .collect(),
        ))
    }

    fn metrics(&self) -> &ConsumerMetrics {
        self.consumer.metrics()
    }

    async fn quantities(&self, product_id: &str) -> (i32, i32) {
        let record = self.engine.get(product_id).await.unwrap();
        (record.total_quantity, record.reserved_quantity)
    }
}

fn reserve_payload(correlation_id: &str, product_id: &str, quantity: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "userId": "user-1",
        "correlationId": correlation_id,
        "items": [{ "productId": product_id, "quantity": quantity, "price": 9.5 }],
        "timestamp": "2024-05-01T12:00:00Z"
    }))
    .unwrap()
}

#[tokio::test]
async fn valid_reservation_succeeds_and_is_timed() {
    let harness = Harness::seeded(&[("P1", 10)]);

    let processed = harness
        .consumer
        .process(RESERVE_TOPIC, Some(&reserve_payload("c-1", "P1", json!(3))))
        .await;

    assert_eq!(processed.state, EventState::Succeeded);
    assert!(processed.state.is_terminal());
    assert!(!processed.duplicate);
    assert_eq!(harness.metrics().count("reserveInventory_success"), 1);
    assert_eq!(harness.metrics().snapshot().durations["reserveInventory"].count, 1);
    assert_eq!(harness.quantities("P1").await, (10, 3));
}

#[tokio::test]
async fn redelivered_reservation_is_acknowledged_once() {
    let harness = Harness::seeded(&[("P1", 10)]);
    let payload = reserve_payload("c-2", "P1", json!(4));

    let first = harness.consumer.process(RESERVE_TOPIC, Some(&payload)).await;
    let second = harness.consumer.process(RESERVE_TOPIC, Some(&payload)).await;

    assert_eq!(first.state, EventState::Succeeded);
    assert_eq!(second.state, EventState::Succeeded);
    assert!(second.duplicate);
    assert_eq!(harness.metrics().count("reserveInventory_success"), 2);
    assert_eq!(harness.quantities("P1").await, (10, 4));
}

#[tokio::test]
async fn malformed_payloads_are_dropped_as_invalid() {
    let harness = Harness::seeded(&[("P1", 10)]);

    let garbage = harness.consumer.process(RESERVE_TOPIC, Some(b"{not json")).await;
    let string_quantity = harness
        .consumer
        .process(RESERVE_TOPIC, Some(&reserve_payload("c-3", "P1", json!("three"))))
        .await;
    let negative = harness
        .consumer
        .process(RESERVE_TOPIC, Some(&reserve_payload("c-4", "P1", json!(-2))))
        .await;
    let empty = harness.consumer.process(RESERVE_TOPIC, None).await;

    for processed in [&garbage, &string_quantity, &negative, &empty] {
        assert_eq!(processed.state, EventState::RejectedInvalid);
        assert!(processed.reason.is_some());
    }
    assert_eq!(harness.metrics().count("reserveInventory_invalid_event"), 4);
    assert_eq!(harness.metrics().count("reserveInventory_success"), 0);
    assert_eq!(harness.quantities("P1").await, (10, 0));
}

#[tokio::test]
async fn insufficient_stock_is_a_business_failure() {
    let harness = Harness::seeded(&[("P1", 2)]);

    let processed = harness
        .consumer
        .process(RESERVE_TOPIC, Some(&reserve_payload("c-5", "P1", json!(5))))
        .await;

    assert_eq!(processed.state, EventState::FailedBusiness);
    assert!(!processed.redeliver);
    assert_eq!(processed.reason.as_deref(), Some("INSUFFICIENT_STOCK"));
    assert_eq!(harness.metrics().count("reserveInventory_failed"), 1);
    assert_eq!(harness.metrics().count("reserveInventory_failed:INSUFFICIENT_STOCK"), 1);
    assert_eq!(harness.quantities("P1").await, (2, 0));
}

#[tokio::test]
async fn unknown_topic_is_counted_as_unrouted() {
    let harness = Harness::seeded(&[]);

    let processed = harness.consumer.process("inventory.audit", Some(b"{}")).await;

    assert_eq!(processed.state, EventState::RejectedInvalid);
    assert_eq!(harness.metrics().count("unrouted_invalid_event"), 1);
}

#[tokio::test]
async fn release_event_defaults_mode_from_its_type() {
    let harness = Harness::seeded(&[("P1", 10)]);
    harness
        .consumer
        .process(RESERVE_TOPIC, Some(&reserve_payload("c-6", "P1", json!(4))))
        .await;

    let place_order = serde_json::to_vec(&json!({
        "userId": "user-1",
        "correlationId": "c-7",
        "type": "place-order",
        "items": [{ "productId": "P1", "quantity": 3 }],
        "timestamp": "2024-05-01T12:05:00Z"
    }))
    .unwrap();
    let processed = harness.consumer.process(RELEASE_TOPIC, Some(&place_order)).await;
    assert_eq!(processed.state, EventState::Succeeded);
    assert_eq!(harness.quantities("P1").await, (7, 1));

    let clear_cart = serde_json::to_vec(&json!({
        "userId": "user-1",
        "correlationId": "c-8",
        "type": "clear-cart",
        "items": [{ "productId": "P1", "quantity": 1 }],
        "timestamp": "2024-05-01T12:06:00Z"
    }))
    .unwrap();
    harness.consumer.process(RELEASE_TOPIC, Some(&clear_cart)).await;
    assert_eq!(harness.quantities("P1").await, (7, 0));
    assert_eq!(harness.metrics().count("releaseInventory_success"), 2);
}

#[tokio::test]
async fn release_beyond_reservation_fails_with_reason() {
    let harness = Harness::seeded(&[("P1", 10)]);
    let payload = serde_json::to_vec(&json!({
        "userId": "user-1",
        "correlationId": "c-9",
        "type": "clear-cart",
        "items": [{ "productId": "P1", "quantity": 1 }],
        "timestamp": "2024-05-01T12:00:00Z"
    }))
    .unwrap();

    let processed = harness.consumer.process(RELEASE_TOPIC, Some(&payload)).await;

    assert_eq!(processed.state, EventState::FailedBusiness);
    assert_eq!(
        harness.metrics().count("releaseInventory_failed:RELEASE_EXCEEDS_RESERVATION"),
        1
    );
}

#[tokio::test]
async fn replenishment_for_unknown_product_is_a_counted_no_op() {
    let harness = Harness::seeded(&[("P1", 1)]);

    let missing = harness
        .consumer
        .process(
            REPLENISH_TOPIC,
            Some(br#"{"productId":"GHOST","quantity":5}"#),
        )
        .await;
    let known = harness
        .consumer
        .process(
            REPLENISH_TOPIC,
            Some(br#"{"productId":"P1","quantity":5,"correlationId":"r-1"}"#),
        )
        .await;

    assert_eq!(missing.state, EventState::FailedBusiness);
    assert_eq!(harness.metrics().count("replenishInventory_failed:PRODUCT_NOT_FOUND"), 1);
    assert_eq!(known.state, EventState::Succeeded);
    assert_eq!(harness.quantities("P1").await, (6, 0));
    assert!(harness.engine.get("GHOST").await.is_err());
}

#[tokio::test]
async fn transient_errors_are_counted_and_left_for_redelivery() {
    let store = MemoryInventoryStore::with_lock_timeout(Duration::from_millis(50));
    {
        let mut tx = store.begin().await.unwrap();
        tx.create_many(vec![NewInventory::new("P1", 5)]).await.unwrap();
        tx.commit().await.unwrap();
    }
    let harness = Harness::new(store.clone());

    let mut holder = store.begin().await.unwrap();
    holder.lock_for_update(&["P1".to_string()]).await.unwrap();

    let processed = harness
        .consumer
        .process(RESERVE_TOPIC, Some(&reserve_payload("c-10", "P1", json!(1))))
        .await;
    assert_eq!(processed.state, EventState::FailedException);
    assert!(processed.redeliver);
    assert_eq!(harness.metrics().count("reserveInventory_exception"), 1);

    holder.rollback().await.unwrap();
    let retried = harness
        .consumer
        .process(RESERVE_TOPIC, Some(&reserve_payload("c-10", "P1", json!(1))))
        .await;
    assert_eq!(retried.state, EventState::Succeeded);
    assert!(!retried.redeliver);
    assert_eq!(harness.quantities("P1").await, (5, 1));
}

struct PanickingHandler;

#[async_trait]
impl EventHandler for PanickingHandler {
    fn name(&self) -> &'static str {
        "explode"
    }

    fn decode(&self, payload: &[u8]) -> Result<InventoryEvent, String> {
        serde_json::from_slice(payload)
            .map(InventoryEvent::Replenish)
            .map_err(|e| e.to_string())
    }

    async fn dispatch(&self, _event: InventoryEvent) -> Result<HandlerOutcome, InventoryError> {
        panic!("handler bug");
    }
}

#[tokio::test]
async fn panicking_handler_does_not_stop_the_consumer() {
    let store = MemoryInventoryStore::seeded(vec![NewInventory::new("P1", 3)]);
    let engine = Arc::new(InventoryEngine::new(store, EngineConfig::default()));
    let router = EventRouter::for_engine(Arc::clone(&engine), &Topics::default())
        .route("inventory.explode", Arc::new(PanickingHandler));
    let consumer = InventoryEventConsumer::new(router, Arc::new(ConsumerMetrics::new()));

    let payload = br#"{"productId":"P1","quantity":1}"#;
    let crashed = consumer.process("inventory.explode", Some(payload)).await;
    let next = consumer.process(REPLENISH_TOPIC, Some(payload)).await;

    assert_eq!(crashed.state, EventState::FailedException);
    assert!(!crashed.redeliver);
    assert_eq!(consumer.metrics().count("explode_exception"), 1);
    assert_eq!(next.state, EventState::Succeeded);
    assert_eq!(engine.get("P1").await.unwrap().total_quantity, 4);
}

#[test]
fn router_lists_every_subscribed_topic() {
    let engine = Arc::new(InventoryEngine::new(
        MemoryInventoryStore::new(),
        EngineConfig::default(),
    ));
    let router = EventRouter::for_engine(engine, &Topics::default());

    assert_eq!(
        router.topics(),
        vec!["inventory.release", "inventory.replenish", "inventory.reserve"]
    );
    assert_eq!(router.handler(RESERVE_TOPIC).map(|h| h.name()), Some("reserveInventory"));
}

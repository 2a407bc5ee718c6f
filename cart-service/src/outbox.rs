//! Transactional outbox: the writer appends events inside a cart unit of
//! work, the relay publishes them in the background, and the admin surface
//! handles rows that keep failing.

use chrono::Utc;
use serde::Serialize;
use shared::{EventType, OutboxStatus, ReleaseInventoryEvent, ReplenishInventoryEvent, ReserveInventoryEvent};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info, warn};

use crate::error::{OutboxError, PublishError};
use crate::models::{NewOutboxEvent, OutboxEvent};
use crate::publisher::EventPublisher;
use crate::store::{DeleteOutcome, OutboxClaim, OutboxSink, OutboxStore};

/// An inventory-affecting intent.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    Reserve(ReserveInventoryEvent),
    Release(ReleaseInventoryEvent),
    Replenish(ReplenishInventoryEvent),
}

impl DomainEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            DomainEvent::Reserve(_) => EventType::ReserveInventory,
            DomainEvent::Release(_) => EventType::ReleaseInventory,
            DomainEvent::Replenish(_) => EventType::ReplenishInventory,
        }
    }

    /// Broker key. Cart intents are keyed by user so every intent of one cart
    /// lands on one partition in the order it was recorded.
    pub fn partition_key(&self) -> String {
        match self {
            DomainEvent::Reserve(e) => e.user_id.clone(),
            DomainEvent::Release(e) => e.user_id.clone(),
            DomainEvent::Replenish(e) => e.product_id.clone(),
        }
    }

    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            DomainEvent::Reserve(e) => serde_json::to_value(e),
            DomainEvent::Release(e) => serde_json::to_value(e),
            DomainEvent::Replenish(e) => serde_json::to_value(e),
        }
    }
}

pub struct OutboxWriter;

impl OutboxWriter {
    /// Appends one PENDING row through an open unit of work. Never publishes.
    pub async fn append<T>(sink: &mut T, event: &DomainEvent) -> Result<OutboxEvent, OutboxError>
    where
        T: OutboxSink + ?Sized,
    {
        let row = NewOutboxEvent::pending(event.event_type(), event.payload()?, event.partition_key());
        let stored = sink.insert_outbox(row).await?;
        info!(
            outbox_id = stored.id,
            event_type = %stored.event_type,
            partition_key = %stored.partition_key,
            "Outbox event recorded"
        );
        Ok(stored)
    }
}

async fn publish_row<P: EventPublisher + ?Sized>(publisher: &P, event: &OutboxEvent) -> Result<(), PublishError> {
    let topic = event
        .topic()
        .ok_or_else(|| PublishError::UnknownEventType(event.event_type.clone()))?;
    let payload = serde_json::to_vec(&event.payload)?;
    publisher.publish(topic, &event.partition_key, &payload).await
}

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub interval: Duration,
    pub batch_size: i64,
    /// FAILED rows are picked up again until they reach this many attempts.
    pub max_attempts: i32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            batch_size: 10,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    pub sent: usize,
    pub failed: usize,
    /// Rows left untouched because an older row with the same key failed.
    pub deferred: usize,
}

pub struct OutboxRelay<S, P: ?Sized> {
    store: S,
    publisher: Arc<P>,
    config: RelayConfig,
}

impl<S: OutboxStore, P: EventPublisher + ?Sized> OutboxRelay<S, P> {
    pub fn new(store: S, publisher: Arc<P>, config: RelayConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.config.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.relay_once().await {
                        error!(transient = e.is_transient(), "Error relaying outbox events: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Outbox relay stopped");
    }

    /// Claims one batch, publishes it in order and records each outcome. After
    /// a failure the rest of that key's rows wait for the next pass.
    pub async fn relay_once(&self) -> Result<RelayReport, OutboxError> {
        let mut claim = self
            .store
            .claim_batch(self.config.batch_size, self.config.max_attempts)
            .await?;
        let events = claim.events().to_vec();
        if events.is_empty() {
            return Ok(RelayReport::default());
        }

        let mut report = RelayReport::default();
        let mut stalled: HashSet<String> = HashSet::new();
        for event in &events {
            if stalled.contains(&event.partition_key) {
                report.deferred += 1;
                continue;
            }
            match publish_row(self.publisher.as_ref(), event).await {
                Ok(()) => {
                    claim.mark_sent(event.id).await?;
                    report.sent += 1;
                    info!(outbox_id = event.id, event_type = %event.event_type, "Published outbox event");
                }
                Err(e) => {
                    claim.mark_failed(event.id, &e.to_string()).await?;
                    report.failed += 1;
                    stalled.insert(event.partition_key.clone());
                    warn!(
                        outbox_id = event.id,
                        partition_key = %event.partition_key,
                        attempts = event.attempts + 1,
                        transient = e.is_transient(),
                        "Failed to publish outbox event: {}",
                        e
                    );
                }
            }
        }
        claim.commit().await?;
        Ok(report)
    }
}

pub struct OutboxAdmin<S, P: ?Sized> {
    store: S,
    publisher: Arc<P>,
}

impl<S: OutboxStore, P: EventPublisher + ?Sized> OutboxAdmin<S, P> {
    pub fn new(store: S, publisher: Arc<P>) -> Self {
        Self { store, publisher }
    }

    pub async fn list_failed(&self) -> Result<Vec<OutboxEvent>, OutboxError> {
        Ok(self.store.list_failed().await?)
    }

    /// Republishes one FAILED row and returns it with its new status.
    pub async fn retry(&self, id: i64) -> Result<OutboxEvent, OutboxError> {
        let Some(mut claim) = self.store.claim_one(id).await? else {
            return match self.store.find(id).await? {
                Some(_) => Err(OutboxError::InFlight(id)),
                None => Err(OutboxError::NotFound(id)),
            };
        };
        let Some(mut event) = claim.events().first().cloned() else {
            return Err(OutboxError::NotFound(id));
        };
        if event.status() != Some(OutboxStatus::Failed) {
            return Err(OutboxError::InvalidState {
                id,
                status: event.status.clone(),
            });
        }

        match publish_row(self.publisher.as_ref(), &event).await {
            Ok(()) => {
                claim.mark_sent(id).await?;
                event.mark_sent(Utc::now());
                info!(outbox_id = id, "Outbox event republished");
            }
            Err(e) => {
                claim.mark_failed(id, &e.to_string()).await?;
                event.mark_failed(e.to_string());
                warn!(outbox_id = id, "Retry of outbox event failed: {}", e);
            }
        }
        claim.commit().await?;
        Ok(event)
    }

    pub async fn delete(&self, id: i64) -> Result<(), OutboxError> {
        match self.store.delete(id).await? {
            DeleteOutcome::Deleted => {
                info!(outbox_id = id, "Outbox event deleted");
                Ok(())
            }
            DeleteOutcome::Pending => Err(OutboxError::InvalidState {
                id,
                status: OutboxStatus::Pending.as_str().to_string(),
            }),
            DeleteOutcome::NotFound => Err(OutboxError::NotFound(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{InventoryItem, ReleaseType};

    fn item(product_id: &str) -> InventoryItem {
        InventoryItem {
            product_id: product_id.to_string(),
            quantity: 1,
            price: 1.0,
        }
    }

    #[test]
    fn cart_intents_are_keyed_by_user() {
        let reserve = DomainEvent::Reserve(ReserveInventoryEvent::new("u1".to_string(), None, vec![item("P1")]));
        assert_eq!(reserve.partition_key(), "u1");
        assert_eq!(reserve.event_type(), EventType::ReserveInventory);

        let release = DomainEvent::Release(ReleaseInventoryEvent::new(
            "u1".to_string(),
            ReleaseType::ClearCart,
            vec![item("P1"), item("P2")],
        ));
        assert_eq!(release.partition_key(), "u1");
    }

    #[test]
    fn replenishment_is_keyed_by_product() {
        let event = DomainEvent::Replenish(ReplenishInventoryEvent {
            product_id: "P7".to_string(),
            quantity: 4,
            correlation_id: None,
            idempotency_key: None,
        });
        assert_eq!(event.partition_key(), "P7");
    }

    #[test]
    fn payload_is_the_wire_event() {
        let event = DomainEvent::Release(ReleaseInventoryEvent::new(
            "u1".to_string(),
            ReleaseType::PlaceOrder,
            vec![item("P1")],
        ));
        let payload = event.payload().unwrap();
        assert_eq!(payload["type"], "place-order");
        assert_eq!(payload["items"][0]["productId"], "P1");
        assert!(payload["idempotencyKey"].is_string());
    }
}

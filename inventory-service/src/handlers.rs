use async_trait::async_trait;
use shared::{
    ReleaseInventoryEvent, ReplenishInventoryEvent, ReserveInventoryEvent, RELEASE_TOPIC, REPLENISH_TOPIC,
    RESERVE_TOPIC,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::engine::{InventoryEngine, ReleaseRequest, ReplenishOutcome, ReplenishRequest, ReservationRequest};
use crate::error::InventoryError;
use crate::store::InventoryStore;

/// A decoded, shape-checked inbound event.
#[derive(Debug, Clone)]
pub enum InventoryEvent {
    Reserve(ReserveInventoryEvent),
    Release(ReleaseInventoryEvent),
    Replenish(ReplenishInventoryEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Applied,
    /// Already applied under the same idempotency key.
    Duplicate,
    /// Business rule said no; the reason is a failure code.
    Rejected(String),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Metric prefix, e.g. `reserveInventory`.
    fn name(&self) -> &'static str;

    fn decode(&self, payload: &[u8]) -> Result<InventoryEvent, String>;

    async fn dispatch(&self, event: InventoryEvent) -> Result<HandlerOutcome, InventoryError>;
}

pub struct ReserveHandler<S> {
    engine: Arc<InventoryEngine<S>>,
}

pub struct ReleaseHandler<S> {
    engine: Arc<InventoryEngine<S>>,
}

pub struct ReplenishHandler<S> {
    engine: Arc<InventoryEngine<S>>,
}

fn unexpected(handler: &str, event: &InventoryEvent) -> InventoryError {
    InventoryError::InvalidRequest(format!("{} cannot handle {:?}", handler, event))
}

fn rejection<'a>(codes: impl Iterator<Item = &'a str>) -> HandlerOutcome {
    let codes: BTreeSet<&str> = codes.collect();
    HandlerOutcome::Rejected(codes.into_iter().collect::<Vec<_>>().join(","))
}

impl<S: InventoryStore> ReserveHandler<S> {
    pub fn new(engine: Arc<InventoryEngine<S>>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl<S: InventoryStore> EventHandler for ReserveHandler<S> {
    fn name(&self) -> &'static str {
        "reserveInventory"
    }

    fn decode(&self, payload: &[u8]) -> Result<InventoryEvent, String> {
        let event: ReserveInventoryEvent = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
        event.validate()?;
        Ok(InventoryEvent::Reserve(event))
    }

    async fn dispatch(&self, event: InventoryEvent) -> Result<HandlerOutcome, InventoryError> {
        let event = match event {
            InventoryEvent::Reserve(event) => event,
            other => return Err(unexpected(self.name(), &other)),
        };
        let request = ReservationRequest {
            idempotency_key: Some(event.resolved_idempotency_key()),
            correlation_id: event.correlation_id,
            user_id: event.user_id,
            order_id: event.order_id,
            items: event.items,
        };

        let result = self.engine.reserve(&request).await?;
        if result.duplicate {
            Ok(HandlerOutcome::Duplicate)
        } else if result.overall_success {
            Ok(HandlerOutcome::Applied)
        } else {
            Ok(rejection(result.failed_items().filter_map(|i| i.reason.map(|r| r.as_str()))))
        }
    }
}

impl<S: InventoryStore> ReleaseHandler<S> {
    pub fn new(engine: Arc<InventoryEngine<S>>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl<S: InventoryStore> EventHandler for ReleaseHandler<S> {
    fn name(&self) -> &'static str {
        "releaseInventory"
    }

    fn decode(&self, payload: &[u8]) -> Result<InventoryEvent, String> {
        let event: ReleaseInventoryEvent = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
        event.validate()?;
        Ok(InventoryEvent::Release(event))
    }

    async fn dispatch(&self, event: InventoryEvent) -> Result<HandlerOutcome, InventoryError> {
        let event = match event {
            InventoryEvent::Release(event) => event,
            other => return Err(unexpected(self.name(), &other)),
        };
        let request = ReleaseRequest {
            idempotency_key: Some(event.resolved_idempotency_key()),
            mode: event.effective_mode(),
            correlation_id: event.correlation_id,
            user_id: event.user_id,
            items: event.items,
        };

        let result = self.engine.release(&request).await?;
        if result.duplicate {
            Ok(HandlerOutcome::Duplicate)
        } else if result.overall_success {
            Ok(HandlerOutcome::Applied)
        } else {
            Ok(rejection(result.failed_items().filter_map(|i| i.reason.map(|r| r.as_str()))))
        }
    }
}

impl<S: InventoryStore> ReplenishHandler<S> {
    pub fn new(engine: Arc<InventoryEngine<S>>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl<S: InventoryStore> EventHandler for ReplenishHandler<S> {
    fn name(&self) -> &'static str {
        "replenishInventory"
    }

    fn decode(&self, payload: &[u8]) -> Result<InventoryEvent, String> {
        let event: ReplenishInventoryEvent = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
        event.validate()?;
        Ok(InventoryEvent::Replenish(event))
    }

    async fn dispatch(&self, event: InventoryEvent) -> Result<HandlerOutcome, InventoryError> {
        let event = match event {
            InventoryEvent::Replenish(event) => event,
            other => return Err(unexpected(self.name(), &other)),
        };
        let request = ReplenishRequest {
            idempotency_key: event.resolved_idempotency_key(),
            product_id: event.product_id,
            quantity: event.quantity,
        };

        match self.engine.replenish(&request).await? {
            ReplenishOutcome::Replenished(_) => Ok(HandlerOutcome::Applied),
            ReplenishOutcome::Duplicate => Ok(HandlerOutcome::Duplicate),
            ReplenishOutcome::NotFound => Ok(HandlerOutcome::Rejected("PRODUCT_NOT_FOUND".to_string())),
        }
    }
}

/// Topic names for the three inventory routes.
#[derive(Debug, Clone)]
pub struct Topics {
    pub reserve: String,
    pub release: String,
    pub replenish: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            reserve: RESERVE_TOPIC.to_string(),
            release: RELEASE_TOPIC.to_string(),
            replenish: REPLENISH_TOPIC.to_string(),
        }
    }
}

/// Topic to handler table, built once at startup.
#[derive(Default, Clone)]
pub struct EventRouter {
    routes: HashMap<String, Arc<dyn EventHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, topic: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.routes.insert(topic.into(), handler);
        self
    }

    pub fn for_engine<S: InventoryStore>(engine: Arc<InventoryEngine<S>>, topics: &Topics) -> Self {
        Self::new()
            .route(topics.reserve.clone(), Arc::new(ReserveHandler::new(Arc::clone(&engine))))
            .route(topics.release.clone(), Arc::new(ReleaseHandler::new(Arc::clone(&engine))))
            .route(topics.replenish.clone(), Arc::new(ReplenishHandler::new(engine)))
    }

    pub fn handler(&self, topic: &str) -> Option<&Arc<dyn EventHandler>> {
        self.routes.get(topic)
    }

    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }
}

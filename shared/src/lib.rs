use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const RESERVE_TOPIC: &str = "inventory.reserve";
pub const RELEASE_TOPIC: &str = "inventory.release";
pub const REPLENISH_TOPIC: &str = "inventory.replenish";

/// Namespace for idempotency keys derived from event contents.
const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_7a2e_93d4_4b8e_a51f_2c0d_8e47_b3a9);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub product_id: String,
    pub quantity: i32,
    #[serde(default)]
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ReserveInventory,
    ReleaseInventory,
    ReplenishInventory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseType {
    PlaceOrder,
    ClearCart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseMode {
    /// Hold dropped, goods go back to the available pool.
    Cancel,
    /// Goods physically come back to the warehouse.
    Return,
    /// Reservation converted into a sale.
    Finalize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveInventoryEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub user_id: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub items: Vec<InventoryItem>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInventoryEvent {
    pub user_id: String,
    pub correlation_id: String,
    #[serde(rename = "type")]
    pub release_type: ReleaseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ReleaseMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub items: Vec<InventoryItem>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplenishInventoryEvent {
    pub product_id: String,
    pub quantity: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ReserveInventory => "RESERVE_INVENTORY",
            EventType::ReleaseInventory => "RELEASE_INVENTORY",
            EventType::ReplenishInventory => "REPLENISH_INVENTORY",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RESERVE_INVENTORY" => Some(EventType::ReserveInventory),
            "RELEASE_INVENTORY" => Some(EventType::ReleaseInventory),
            "REPLENISH_INVENTORY" => Some(EventType::ReplenishInventory),
            _ => None,
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            EventType::ReserveInventory => RESERVE_TOPIC,
            EventType::ReleaseInventory => RELEASE_TOPIC,
            EventType::ReplenishInventory => REPLENISH_TOPIC,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ReleaseType {
    pub fn default_mode(&self) -> ReleaseMode {
        match self {
            ReleaseType::PlaceOrder => ReleaseMode::Finalize,
            ReleaseType::ClearCart => ReleaseMode::Cancel,
        }
    }
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(OutboxStatus::Pending),
            "SENT" => Some(OutboxStatus::Sent),
            "FAILED" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable key for de-duplicating at-least-once deliveries of one intent.
///
/// Product ids are sorted so the key does not depend on item order.
pub fn idempotency_key<'a, I>(event_type: EventType, correlation_id: &str, product_ids: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut products: Vec<&str> = product_ids.into_iter().collect();
    products.sort_unstable();
    let name = format!("{}:{}:{}", event_type.as_str(), correlation_id, products.join(","));
    Uuid::new_v5(&IDEMPOTENCY_NAMESPACE, name.as_bytes()).to_string()
}

/// Shape check for an item batch: non-empty, every line names a product and
/// asks for a positive quantity.
pub fn check_items(items: &[InventoryItem]) -> Result<(), String> {
    if items.is_empty() {
        return Err("items must not be empty".to_string());
    }
    for item in items {
        if item.product_id.trim().is_empty() {
            return Err("productId must not be empty".to_string());
        }
        if item.quantity <= 0 {
            return Err(format!(
                "quantity for product {} must be positive, got {}",
                item.product_id, item.quantity
            ));
        }
    }
    Ok(())
}

impl ReserveInventoryEvent {
    pub fn new(user_id: String, order_id: Option<String>, items: Vec<InventoryItem>) -> Self {
        let correlation_id = Uuid::new_v4().to_string();
        let key = idempotency_key(
            EventType::ReserveInventory,
            &correlation_id,
            items.iter().map(|i| i.product_id.as_str()),
        );
        Self {
            order_id,
            user_id,
            correlation_id,
            idempotency_key: Some(key),
            items,
            timestamp: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.user_id.trim().is_empty() {
            return Err("userId must not be empty".to_string());
        }
        check_items(&self.items)
    }

    pub fn resolved_idempotency_key(&self) -> String {
        self.idempotency_key.clone().unwrap_or_else(|| {
            idempotency_key(
                EventType::ReserveInventory,
                &self.correlation_id,
                self.items.iter().map(|i| i.product_id.as_str()),
            )
        })
    }
}

impl ReleaseInventoryEvent {
    pub fn new(user_id: String, release_type: ReleaseType, items: Vec<InventoryItem>) -> Self {
        let correlation_id = Uuid::new_v4().to_string();
        let key = idempotency_key(
            EventType::ReleaseInventory,
            &correlation_id,
            items.iter().map(|i| i.product_id.as_str()),
        );
        Self {
            user_id,
            correlation_id,
            release_type,
            mode: None,
            idempotency_key: Some(key),
            items,
            timestamp: Utc::now(),
        }
    }

    pub fn with_mode(mut self, mode: ReleaseMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn effective_mode(&self) -> ReleaseMode {
        self.mode.unwrap_or_else(|| self.release_type.default_mode())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.user_id.trim().is_empty() {
            return Err("userId must not be empty".to_string());
        }
        check_items(&self.items)
    }

    pub fn resolved_idempotency_key(&self) -> String {
        self.idempotency_key.clone().unwrap_or_else(|| {
            idempotency_key(
                EventType::ReleaseInventory,
                &self.correlation_id,
                self.items.iter().map(|i| i.product_id.as_str()),
            )
        })
    }
}

impl ReplenishInventoryEvent {
    pub fn validate(&self) -> Result<(), String> {
        if self.product_id.trim().is_empty() {
            return Err("productId must not be empty".to_string());
        }
        if self.quantity <= 0 {
            return Err(format!("quantity must be positive, got {}", self.quantity));
        }
        Ok(())
    }

    /// Replenishments without a correlation id are not de-duplicated.
    pub fn resolved_idempotency_key(&self) -> Option<String> {
        self.idempotency_key.clone().or_else(|| {
            self.correlation_id.as_deref().map(|correlation_id| {
                idempotency_key(
                    EventType::ReplenishInventory,
                    correlation_id,
                    [self.product_id.as_str()],
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(product_id: &str, quantity: i32) -> InventoryItem {
        InventoryItem {
            product_id: product_id.to_string(),
            quantity,
            price: 9.5,
        }
    }

    #[test]
    fn idempotency_key_ignores_item_order() {
        let a = idempotency_key(EventType::ReserveInventory, "c-1", ["P2", "P1"]);
        let b = idempotency_key(EventType::ReserveInventory, "c-1", ["P1", "P2"]);
        assert_eq!(a, b);
    }

    #[test]
    fn idempotency_key_distinguishes_event_types() {
        let reserve = idempotency_key(EventType::ReserveInventory, "c-1", ["P1"]);
        let release = idempotency_key(EventType::ReleaseInventory, "c-1", ["P1"]);
        assert_ne!(reserve, release);
    }

    #[test]
    fn reserve_event_uses_camel_case_on_the_wire() {
        let event = ReserveInventoryEvent::new("u-1".to_string(), None, vec![item("P1", 3)]);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["userId"], "u-1");
        assert_eq!(json["items"][0]["productId"], "P1");
        assert!(json.get("orderId").is_none());
        assert_eq!(
            json["idempotencyKey"].as_str().unwrap(),
            event.resolved_idempotency_key()
        );
    }

    #[test]
    fn missing_key_is_derived_from_contents() {
        let mut event = ReserveInventoryEvent::new("u-1".to_string(), None, vec![item("P1", 3)]);
        let original = event.resolved_idempotency_key();
        event.idempotency_key = None;
        assert_eq!(event.resolved_idempotency_key(), original);
    }

    #[test]
    fn release_type_selects_default_mode() {
        let raw = r#"{"userId":"u-1","correlationId":"c-1","type":"place-order",
            "items":[{"productId":"P1","quantity":1,"price":1.0}],
            "timestamp":"2024-01-01T00:00:00Z"}"#;
        let event: ReleaseInventoryEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.effective_mode(), ReleaseMode::Finalize);

        let cleared = ReleaseInventoryEvent::new("u-1".to_string(), ReleaseType::ClearCart, vec![item("P1", 1)]);
        assert_eq!(cleared.effective_mode(), ReleaseMode::Cancel);
        assert_eq!(cleared.with_mode(ReleaseMode::Return).effective_mode(), ReleaseMode::Return);
    }

    #[test]
    fn non_numeric_quantity_is_rejected_at_parse_time() {
        let raw = r#"{"productId":"P1","quantity":"three"}"#;
        assert!(serde_json::from_str::<ReplenishInventoryEvent>(raw).is_err());
    }

    #[test]
    fn validation_rejects_empty_and_non_positive_items() {
        let empty = ReserveInventoryEvent::new("u-1".to_string(), None, vec![]);
        assert!(empty.validate().is_err());

        let zero = ReserveInventoryEvent::new("u-1".to_string(), None, vec![item("P1", 0)]);
        assert!(zero.validate().is_err());

        let ok = ReserveInventoryEvent::new("u-1".to_string(), None, vec![item("P1", 2)]);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn replenish_without_correlation_has_no_key() {
        let event = ReplenishInventoryEvent {
            product_id: "P1".to_string(),
            quantity: 5,
            correlation_id: None,
            idempotency_key: None,
        };
        assert!(event.resolved_idempotency_key().is_none());
    }
}

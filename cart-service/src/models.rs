use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use shared::{EventType, InventoryItem, OutboxStatus};

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::cart_items)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub user_id: String,
    pub product_id: String,
    pub quantity: i32,
    pub price: BigDecimal,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::cart_items)]
pub struct NewCartItem {
    pub user_id: String,
    pub product_id: String,
    pub quantity: i32,
    pub price: BigDecimal,
}

impl CartItem {
    pub fn to_inventory_item(&self) -> InventoryItem {
        InventoryItem {
            product_id: self.product_id.clone(),
            quantity: self.quantity,
            price: self.price.to_f64().unwrap_or_default(),
        }
    }
}

impl NewCartItem {
    pub fn new(user_id: impl Into<String>, product_id: impl Into<String>, quantity: i32, price: f64) -> Self {
        Self {
            user_id: user_id.into(),
            product_id: product_id.into(),
            quantity,
            price: BigDecimal::from_f64(price).unwrap_or_default().with_scale(2),
        }
    }

    pub fn into_record(self, created_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> CartItem {
        CartItem {
            user_id: self.user_id,
            product_id: self.product_id,
            quantity: self.quantity,
            price: self.price,
            created_at: created_at.or(Some(now)),
            updated_at: Some(now),
        }
    }
}

/// A row of the transactional outbox.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::outbox_events)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEvent {
    pub id: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub partition_key: String,
    pub status: String,
    pub attempts: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub partition_key: String,
    pub status: String,
}

impl OutboxEvent {
    pub fn status(&self) -> Option<OutboxStatus> {
        OutboxStatus::parse(&self.status)
    }

    pub fn topic(&self) -> Option<&'static str> {
        EventType::parse(&self.event_type).map(|t| t.topic())
    }

    pub fn mark_sent(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Sent.as_str().to_string();
        self.sent_at = Some(now);
        self.error = None;
        self.attempts += 1;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = OutboxStatus::Failed.as_str().to_string();
        self.error = Some(error.into());
        self.attempts += 1;
    }
}

impl NewOutboxEvent {
    pub fn pending(event_type: EventType, payload: serde_json::Value, partition_key: impl Into<String>) -> Self {
        Self {
            event_type: event_type.as_str().to_string(),
            payload,
            partition_key: partition_key.into(),
            status: OutboxStatus::Pending.as_str().to_string(),
        }
    }

    pub fn into_record(self, id: i64, now: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent {
            id,
            event_type: self.event_type,
            payload: self.payload,
            partition_key: self.partition_key,
            status: self.status,
            attempts: 0,
            error: None,
            created_at: now,
            sent_at: None,
        }
    }
}

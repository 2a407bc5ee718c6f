#![allow(dead_code)]

use async_trait::async_trait;
use cart_service::error::{CartError, PublishError};
use cart_service::inventory_client::{RejectedItem, StockReport, StockValidator};
use cart_service::publisher::EventPublisher;
use shared::InventoryItem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub key: String,
    pub payload: serde_json::Value,
}

/// Records every publish; fails them all while `failing` is set, and the
/// next `fail_next` calls otherwise.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Published>>,
    failing: AtomicBool,
    fail_next: AtomicUsize,
    delay: Option<Duration>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_next(&self, calls: usize) {
        self.fail_next.store(calls, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), PublishError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scheduled = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled || self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Broker("broker down".to_string()));
        }
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: serde_json::from_slice(payload).unwrap(),
        });
        Ok(())
    }
}

/// Accepts everything except the listed products.
#[derive(Default)]
pub struct StubValidator {
    out_of_stock: Vec<String>,
    unavailable: bool,
}

impl StubValidator {
    pub fn accepting() -> Self {
        Self::default()
    }

    pub fn rejecting(product_id: &str) -> Self {
        Self {
            out_of_stock: vec![product_id.to_string()],
            unavailable: false,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            out_of_stock: Vec::new(),
            unavailable: true,
        }
    }
}

#[async_trait]
impl StockValidator for StubValidator {
    async fn validate(&self, items: &[InventoryItem]) -> Result<StockReport, CartError> {
        if self.unavailable {
            return Err(CartError::InventoryUnavailable("connection refused".to_string()));
        }
        let invalid_items: Vec<RejectedItem> = items
            .iter()
            .filter(|item| self.out_of_stock.contains(&item.product_id))
            .map(|item| RejectedItem {
                item: item.clone(),
                reasons: vec![format!(
                    "Insufficient stock for product {}: requested {}, available 0",
                    item.product_id, item.quantity
                )],
            })
            .collect();
        Ok(StockReport {
            success: invalid_items.is_empty(),
            invalid_items,
        })
    }
}

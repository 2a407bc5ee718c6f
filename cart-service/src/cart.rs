use serde::{Deserialize, Serialize};
use shared::{InventoryItem, ReleaseInventoryEvent, ReleaseMode, ReleaseType, ReserveInventoryEvent};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::CartError;
use crate::inventory_client::StockValidator;
use crate::models::{CartItem, NewCartItem};
use crate::outbox::{DomainEvent, OutboxWriter};
use crate::store::{CartStore, CartTx};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddItem {
    pub product_id: String,
    pub quantity: i32,
    #[serde(default)]
    pub price: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutReceipt {
    pub order_id: String,
    pub items: Vec<CartItem>,
}

/// Cart mutations. Each one commits the cart change and exactly one outbox
/// row together; inventory is only touched once the relay publishes.
pub struct CartService<S, V: ?Sized> {
    store: S,
    validator: Arc<V>,
}

fn inventory_items(items: &[CartItem]) -> Vec<InventoryItem> {
    items.iter().map(CartItem::to_inventory_item).collect()
}

impl<S: CartStore, V: StockValidator + ?Sized> CartService<S, V> {
    pub fn new(store: S, validator: Arc<V>) -> Self {
        Self { store, validator }
    }

    pub async fn get_cart(&self, user_id: &str) -> Result<Vec<CartItem>, CartError> {
        Ok(self.store.list_items(user_id).await?)
    }

    /// Pre-flights stock for the added quantity, then records the line and a
    /// reservation intent for that quantity.
    pub async fn add_item(&self, user_id: &str, request: AddItem) -> Result<CartItem, CartError> {
        if user_id.trim().is_empty() || request.product_id.trim().is_empty() {
            return Err(CartError::InvalidRequest("userId and productId are required".to_string()));
        }
        if request.quantity <= 0 {
            return Err(CartError::InvalidRequest(format!(
                "quantity must be positive, got {}",
                request.quantity
            )));
        }
        if !request.price.is_finite() || request.price < 0.0 {
            return Err(CartError::InvalidRequest(format!("invalid price {}", request.price)));
        }

        let wanted = InventoryItem {
            product_id: request.product_id.clone(),
            quantity: request.quantity,
            price: request.price,
        };
        let report = self.validator.validate(std::slice::from_ref(&wanted)).await?;
        if !report.success {
            warn!(user_id, product_id = %request.product_id, "Stock pre-flight rejected cart addition");
            return Err(CartError::InsufficientStock(report.reasons()));
        }

        let mut tx = self.store.begin().await?;
        let existing = tx.find_item(user_id, &request.product_id).await?;
        if let Some(existing) = existing {
            if existing.quantity.checked_add(request.quantity).is_none() {
                tx.rollback().await?;
                return Err(CartError::InvalidRequest("cart quantity overflow".to_string()));
            }
        }

        let item = tx
            .increment_item(NewCartItem::new(user_id, &request.product_id, request.quantity, request.price))
            .await?;
        let event = DomainEvent::Reserve(ReserveInventoryEvent::new(user_id.to_string(), None, vec![wanted]));
        OutboxWriter::append(&mut tx, &event).await?;
        tx.commit().await?;

        info!(user_id, product_id = %item.product_id, quantity = item.quantity, "Cart item added");
        Ok(item)
    }

    /// Drops one line and cancels its reservation.
    pub async fn remove_item(&self, user_id: &str, product_id: &str) -> Result<CartItem, CartError> {
        let mut tx = self.store.begin().await?;
        let Some(removed) = tx.remove_item(user_id, product_id).await? else {
            tx.rollback().await?;
            return Err(CartError::NotFound {
                user_id: user_id.to_string(),
                product_id: product_id.to_string(),
            });
        };

        let event = DomainEvent::Release(
            ReleaseInventoryEvent::new(
                user_id.to_string(),
                ReleaseType::ClearCart,
                vec![removed.to_inventory_item()],
            )
            .with_mode(ReleaseMode::Cancel),
        );
        OutboxWriter::append(&mut tx, &event).await?;
        tx.commit().await?;

        info!(user_id, product_id, "Cart item removed");
        Ok(removed)
    }

    /// Empties the cart and cancels every reservation it held. An empty cart
    /// produces no event.
    pub async fn clear_cart(&self, user_id: &str) -> Result<Vec<CartItem>, CartError> {
        let mut tx = self.store.begin().await?;
        let removed = tx.clear(user_id).await?;
        if removed.is_empty() {
            tx.rollback().await?;
            return Ok(removed);
        }

        let event = DomainEvent::Release(ReleaseInventoryEvent::new(
            user_id.to_string(),
            ReleaseType::ClearCart,
            inventory_items(&removed),
        ));
        OutboxWriter::append(&mut tx, &event).await?;
        tx.commit().await?;

        info!(user_id, items = removed.len(), "Cart cleared");
        Ok(removed)
    }

    /// Converts the cart's reservations into a sale and empties it.
    pub async fn checkout(&self, user_id: &str) -> Result<CheckoutReceipt, CartError> {
        let mut tx = self.store.begin().await?;
        let items = tx.clear(user_id).await?;
        if items.is_empty() {
            tx.rollback().await?;
            return Err(CartError::InvalidRequest(format!("cart of user {} is empty", user_id)));
        }

        let event = DomainEvent::Release(ReleaseInventoryEvent::new(
            user_id.to_string(),
            ReleaseType::PlaceOrder,
            inventory_items(&items),
        ));
        OutboxWriter::append(&mut tx, &event).await?;
        tx.commit().await?;

        let order_id = Uuid::new_v4().to_string();
        info!(user_id, order_id = %order_id, items = items.len(), "Cart checked out");
        Ok(CheckoutReceipt { order_id, items })
    }
}

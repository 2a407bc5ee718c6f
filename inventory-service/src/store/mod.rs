//! Inventory persistence.
//!
//! Reads go through [`InventoryStore`]; every mutation goes through an
//! [`InventoryTx`] so that several inventory rows and the processed-event
//! marker commit or roll back together.

mod memory;
mod postgres;

pub use memory::MemoryInventoryStore;
pub use postgres::{DbPool, PgInventoryStore, PgInventoryTx};

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::StoreResult;
use crate::models::{Inventory, InventoryPatch, NewInventory};

#[async_trait]
pub trait InventoryStore: Send + Sync + 'static {
    type Tx: InventoryTx;

    async fn begin(&self) -> StoreResult<Self::Tx>;

    async fn find_by_product_id(&self, product_id: &str) -> StoreResult<Option<Inventory>>;

    async fn find_many(&self, product_ids: &[String]) -> StoreResult<Vec<Inventory>>;
}

/// A unit of work. Dropping it without `commit` discards every change.
#[async_trait]
pub trait InventoryTx: Send {
    /// Locks the existing rows among `product_ids` until commit or rollback.
    /// Locks are taken in ascending product id order; missing products are
    /// absent from the returned map.
    async fn lock_for_update(&mut self, product_ids: &[String]) -> StoreResult<HashMap<String, Inventory>>;

    async fn update(&mut self, product_id: &str, patch: InventoryPatch) -> StoreResult<Inventory>;

    async fn create_many(&mut self, records: Vec<NewInventory>) -> StoreResult<Vec<Inventory>>;

    async fn delete(&mut self, product_id: &str) -> StoreResult<bool>;

    /// Records `key` as processed. Returns `false` if it already was.
    async fn claim_idempotency_key(&mut self, key: &str, event_type: &str) -> StoreResult<bool>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

fn sorted_unique(product_ids: &[String]) -> Vec<String> {
    let mut ids = product_ids.to_vec();
    ids.sort();
    ids.dedup();
    ids
}

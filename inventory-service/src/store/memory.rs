use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};

use super::{sorted_unique, InventoryStore, InventoryTx};
use crate::error::{StoreError, StoreResult};
use crate::models::{Inventory, InventoryPatch, NewInventory};

type Row = Arc<RowMutex<Option<Inventory>>>;

/// In-process store with per-row locks, used by tests and local runs.
///
/// A unit of work holds the row mutexes it touched until it commits or is
/// dropped, which gives the same exclusion as `SELECT ... FOR UPDATE`.
#[derive(Clone)]
pub struct MemoryInventoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    rows: Mutex<HashMap<String, Row>>,
    processed: Mutex<HashSet<String>>,
    lock_timeout: Duration,
}

pub struct MemoryInventoryTx {
    inner: Arc<Inner>,
    guards: BTreeMap<String, OwnedMutexGuard<Option<Inventory>>>,
    staged: HashMap<String, Option<Inventory>>,
    claimed_keys: Vec<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryInventoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(Duration::from_secs(5))
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                rows: Mutex::new(HashMap::new()),
                processed: Mutex::new(HashSet::new()),
                lock_timeout,
            }),
        }
    }

    pub fn seeded(records: Vec<NewInventory>) -> Self {
        let store = Self::new();
        let now = Utc::now();
        {
            let mut rows = lock(&store.inner.rows);
            for record in records {
                let record = record.into_record(now);
                rows.insert(record.product_id.clone(), Arc::new(RowMutex::new(Some(record))));
            }
        }
        store
    }

    fn row(&self, product_id: &str) -> Option<Row> {
        lock(&self.inner.rows).get(product_id).cloned()
    }

    async fn read(&self, product_id: &str) -> StoreResult<Option<Inventory>> {
        let Some(row) = self.row(product_id) else {
            return Ok(None);
        };
        let guard = tokio::time::timeout(self.inner.lock_timeout, row.lock())
            .await
            .map_err(|_| StoreError::LockTimeout(product_id.to_string()))?;
        Ok(guard.clone())
    }
}

impl Default for MemoryInventoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InventoryStore for MemoryInventoryStore {
    type Tx = MemoryInventoryTx;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        Ok(MemoryInventoryTx {
            inner: Arc::clone(&self.inner),
            guards: BTreeMap::new(),
            staged: HashMap::new(),
            claimed_keys: Vec::new(),
        })
    }

    async fn find_by_product_id(&self, product_id: &str) -> StoreResult<Option<Inventory>> {
        self.read(product_id).await
    }

    async fn find_many(&self, product_ids: &[String]) -> StoreResult<Vec<Inventory>> {
        let mut records = Vec::new();
        for product_id in sorted_unique(product_ids) {
            if let Some(record) = self.read(&product_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

impl MemoryInventoryTx {
    async fn lock_row(&mut self, product_id: &str) -> StoreResult<()> {
        if self.guards.contains_key(product_id) {
            return Ok(());
        }
        let row = {
            let mut rows = lock(&self.inner.rows);
            Arc::clone(
                rows.entry(product_id.to_string())
                    .or_insert_with(|| Arc::new(RowMutex::new(None))),
            )
        };
        let guard = tokio::time::timeout(self.inner.lock_timeout, row.lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout(product_id.to_string()))?;
        self.guards.insert(product_id.to_string(), guard);
        Ok(())
    }

    /// Drops every row guard, then forgets placeholder rows for products that
    /// do not exist and that no other unit of work is waiting on.
    fn release(&mut self) {
        let vacant: Vec<String> = self
            .guards
            .iter()
            .filter(|(_, guard)| guard.is_none())
            .map(|(product_id, _)| product_id.clone())
            .collect();
        self.guards.clear();
        if vacant.is_empty() {
            return;
        }

        let mut rows = lock(&self.inner.rows);
        for product_id in vacant {
            let idle = rows.get(&product_id).is_some_and(|row| {
                Arc::strong_count(row) == 1 && row.try_lock().map(|value| value.is_none()).unwrap_or(false)
            });
            if idle {
                rows.remove(&product_id);
            }
        }
    }

    fn current(&self, product_id: &str) -> Option<Inventory> {
        match self.staged.get(product_id) {
            Some(staged) => staged.clone(),
            None => self.guards.get(product_id).and_then(|guard| (**guard).clone()),
        }
    }
}

#[async_trait]
impl InventoryTx for MemoryInventoryTx {
    async fn lock_for_update(&mut self, product_ids: &[String]) -> StoreResult<HashMap<String, Inventory>> {
        let mut locked = HashMap::new();
        for product_id in sorted_unique(product_ids) {
            self.lock_row(&product_id).await?;
            if let Some(record) = self.current(&product_id) {
                locked.insert(product_id, record);
            }
        }
        Ok(locked)
    }

    async fn update(&mut self, product_id: &str, patch: InventoryPatch) -> StoreResult<Inventory> {
        self.lock_row(product_id).await?;
        let mut record = self
            .current(product_id)
            .ok_or_else(|| StoreError::MissingRecord(product_id.to_string()))?;
        record.apply(&patch);
        if !record.is_consistent() {
            return Err(StoreError::InvariantViolation {
                product_id: product_id.to_string(),
                total: record.total_quantity,
                reserved: record.reserved_quantity,
            });
        }
        record.updated_at = Some(Utc::now());
        self.staged.insert(product_id.to_string(), Some(record.clone()));
        Ok(record)
    }

    async fn create_many(&mut self, mut records: Vec<NewInventory>) -> StoreResult<Vec<Inventory>> {
        records.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        let now = Utc::now();
        let mut created = Vec::with_capacity(records.len());
        for record in records {
            if !record.is_consistent() {
                return Err(StoreError::InvariantViolation {
                    product_id: record.product_id,
                    total: record.total_quantity,
                    reserved: record.reserved_quantity,
                });
            }
            self.lock_row(&record.product_id).await?;
            if self.current(&record.product_id).is_some() {
                return Err(StoreError::DuplicateRecord(record.product_id));
            }
            let record = record.into_record(now);
            self.staged.insert(record.product_id.clone(), Some(record.clone()));
            created.push(record);
        }
        Ok(created)
    }

    async fn delete(&mut self, product_id: &str) -> StoreResult<bool> {
        self.lock_row(product_id).await?;
        if self.current(product_id).is_none() {
            return Ok(false);
        }
        self.staged.insert(product_id.to_string(), None);
        Ok(true)
    }

    async fn claim_idempotency_key(&mut self, key: &str, _event_type: &str) -> StoreResult<bool> {
        if self.claimed_keys.iter().any(|k| k == key) || lock(&self.inner.processed).contains(key) {
            return Ok(false);
        }
        self.claimed_keys.push(key.to_string());
        Ok(true)
    }

    async fn commit(mut self) -> StoreResult<()> {
        for (product_id, value) in self.staged.drain() {
            if let Some(guard) = self.guards.get_mut(&product_id) {
                **guard = value;
            }
        }
        lock(&self.inner.processed).extend(self.claimed_keys.drain(..));
        // Row guards are released only after the writes above are visible.
        self.release();
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        Ok(())
    }
}

impl Drop for MemoryInventoryTx {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(store: &MemoryInventoryStore) -> Vec<String> {
        let mut ids: Vec<String> = lock(&store.inner.rows).keys().cloned().collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn locking_unknown_products_leaves_no_rows_behind() {
        let store = MemoryInventoryStore::seeded(vec![NewInventory::new("P1", 5)]);

        let mut tx = store.begin().await.unwrap();
        let locked = tx
            .lock_for_update(&["GHOST-1".to_string(), "P1".to_string()])
            .await
            .unwrap();
        assert_eq!(locked.len(), 1);
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.lock_for_update(&["GHOST-2".to_string()]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(tracked(&store), vec!["P1".to_string()]);
    }

    #[tokio::test]
    async fn deleted_and_created_rows_are_tracked_correctly() {
        let store = MemoryInventoryStore::seeded(vec![NewInventory::new("P1", 5)]);

        let mut tx = store.begin().await.unwrap();
        assert!(tx.delete("P1").await.unwrap());
        tx.create_many(vec![NewInventory::new("P2", 3)]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(tracked(&store), vec!["P2".to_string()]);
        assert!(store.find_by_product_id("P1").await.unwrap().is_none());
        assert_eq!(store.find_by_product_id("P2").await.unwrap().unwrap().total_quantity, 3);
    }
}

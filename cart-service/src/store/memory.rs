use async_trait::async_trait;
use chrono::Utc;
use shared::OutboxStatus;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as StateMutex, OwnedMutexGuard};

use super::{head_of_line, CartStore, CartTx, DeleteOutcome, OutboxClaim, OutboxSink, OutboxStore};
use crate::error::{StoreError, StoreResult};
use crate::models::{CartItem, NewCartItem, NewOutboxEvent, OutboxEvent};

#[derive(Debug, Clone, Default)]
struct State {
    carts: BTreeMap<(String, String), CartItem>,
    outbox: BTreeMap<i64, OutboxEvent>,
    next_id: i64,
}

#[derive(Default)]
struct Inner {
    state: Arc<StateMutex<State>>,
    claimed: Mutex<HashSet<i64>>,
}

/// In-process cart and outbox store.
///
/// Units of work are serialized: a [`MemoryCartTx`] holds the whole state
/// until it commits or is dropped. Relay claims are tracked in a separate
/// in-flight set, so claimed rows are skipped by concurrent relays.
#[derive(Clone, Default)]
pub struct MemoryCartStore {
    inner: Arc<Inner>,
}

pub struct MemoryCartTx {
    guard: OwnedMutexGuard<State>,
    working: State,
}

pub struct MemoryOutboxClaim {
    inner: Arc<Inner>,
    events: Vec<OutboxEvent>,
    staged: HashMap<i64, OutboxEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn by_age(events: &mut [OutboxEvent]) {
    events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

impl MemoryCartStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every outbox row, oldest first.
    pub async fn outbox_events(&self) -> Vec<OutboxEvent> {
        let state = self.inner.state.lock().await;
        let mut events: Vec<OutboxEvent> = state.outbox.values().cloned().collect();
        by_age(&mut events);
        events
    }

    fn claim(&self, events: Vec<OutboxEvent>) -> MemoryOutboxClaim {
        let mut claimed = lock(&self.inner.claimed);
        claimed.extend(events.iter().map(|e| e.id));
        MemoryOutboxClaim {
            inner: Arc::clone(&self.inner),
            events,
            staged: HashMap::new(),
        }
    }
}

#[async_trait]
impl CartStore for MemoryCartStore {
    type Tx = MemoryCartTx;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        let guard = Arc::clone(&self.inner.state).lock_owned().await;
        let working = guard.clone();
        Ok(MemoryCartTx { guard, working })
    }

    async fn list_items(&self, user_id: &str) -> StoreResult<Vec<CartItem>> {
        let state = self.inner.state.lock().await;
        Ok(state
            .carts
            .values()
            .filter(|item| item.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OutboxSink for MemoryCartTx {
    async fn insert_outbox(&mut self, event: NewOutboxEvent) -> StoreResult<OutboxEvent> {
        self.working.next_id += 1;
        let record = event.into_record(self.working.next_id, Utc::now());
        self.working.outbox.insert(record.id, record.clone());
        Ok(record)
    }
}

#[async_trait]
impl CartTx for MemoryCartTx {
    async fn find_item(&mut self, user_id: &str, product_id: &str) -> StoreResult<Option<CartItem>> {
        Ok(self
            .working
            .carts
            .get(&(user_id.to_string(), product_id.to_string()))
            .cloned())
    }

    async fn increment_item(&mut self, mut item: NewCartItem) -> StoreResult<CartItem> {
        let key = (item.user_id.clone(), item.product_id.clone());
        let existing = self.working.carts.get(&key);
        let created_at = existing.and_then(|existing| existing.created_at);
        if let Some(existing) = existing {
            item.quantity = existing.quantity.saturating_add(item.quantity);
        }
        let record = item.into_record(created_at, Utc::now());
        self.working.carts.insert(key, record.clone());
        Ok(record)
    }

    async fn remove_item(&mut self, user_id: &str, product_id: &str) -> StoreResult<Option<CartItem>> {
        Ok(self
            .working
            .carts
            .remove(&(user_id.to_string(), product_id.to_string())))
    }

    async fn clear(&mut self, user_id: &str) -> StoreResult<Vec<CartItem>> {
        let keys: Vec<(String, String)> = self
            .working
            .carts
            .keys()
            .filter(|(owner, _)| owner == user_id)
            .cloned()
            .collect();
        Ok(keys
            .into_iter()
            .filter_map(|key| self.working.carts.remove(&key))
            .collect())
    }

    async fn commit(self) -> StoreResult<()> {
        let MemoryCartTx { mut guard, working } = self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryCartStore {
    type Claim = MemoryOutboxClaim;

    async fn claim_batch(&self, limit: i64, max_attempts: i32) -> StoreResult<Self::Claim> {
        let state = self.inner.state.lock().await;
        let mut unsent: Vec<&OutboxEvent> = state
            .outbox
            .values()
            .filter(|e| e.status() != Some(OutboxStatus::Sent))
            .collect();
        unsent.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let backlog: Vec<(i64, String)> = unsent.iter().map(|e| (e.id, e.partition_key.clone())).collect();

        let mut candidates: Vec<OutboxEvent> = {
            let claimed = lock(&self.inner.claimed);
            unsent
                .iter()
                .filter(|e| !claimed.contains(&e.id))
                .filter(|e| match e.status() {
                    Some(OutboxStatus::Pending) => true,
                    Some(OutboxStatus::Failed) => e.attempts < max_attempts,
                    _ => false,
                })
                .map(|e| (*e).clone())
                .collect()
        };
        candidates = head_of_line(candidates, &backlog);
        candidates.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(self.claim(candidates))
    }

    async fn claim_one(&self, id: i64) -> StoreResult<Option<Self::Claim>> {
        let state = self.inner.state.lock().await;
        let Some(event) = state.outbox.get(&id) else {
            return Ok(None);
        };
        if lock(&self.inner.claimed).contains(&id) {
            return Ok(None);
        }
        Ok(Some(self.claim(vec![event.clone()])))
    }

    async fn find(&self, id: i64) -> StoreResult<Option<OutboxEvent>> {
        Ok(self.inner.state.lock().await.outbox.get(&id).cloned())
    }

    async fn list_failed(&self) -> StoreResult<Vec<OutboxEvent>> {
        let state = self.inner.state.lock().await;
        let mut failed: Vec<OutboxEvent> = state
            .outbox
            .values()
            .filter(|e| e.status() == Some(OutboxStatus::Failed))
            .cloned()
            .collect();
        by_age(&mut failed);
        Ok(failed)
    }

    async fn delete(&self, id: i64) -> StoreResult<DeleteOutcome> {
        let mut state = self.inner.state.lock().await;
        match state.outbox.get(&id).map(OutboxEvent::status) {
            None => Ok(DeleteOutcome::NotFound),
            Some(Some(OutboxStatus::Pending)) => Ok(DeleteOutcome::Pending),
            Some(_) => {
                state.outbox.remove(&id);
                Ok(DeleteOutcome::Deleted)
            }
        }
    }
}

impl MemoryOutboxClaim {
    fn claimed(&self, id: i64) -> StoreResult<OutboxEvent> {
        self.staged
            .get(&id)
            .or_else(|| self.events.iter().find(|e| e.id == id))
            .cloned()
            .ok_or(StoreError::NotClaimed(id))
    }
}

#[async_trait]
impl OutboxClaim for MemoryOutboxClaim {
    fn events(&self) -> &[OutboxEvent] {
        &self.events
    }

    async fn mark_sent(&mut self, id: i64) -> StoreResult<()> {
        let mut event = self.claimed(id)?;
        event.mark_sent(Utc::now());
        self.staged.insert(id, event);
        Ok(())
    }

    async fn mark_failed(&mut self, id: i64, error: &str) -> StoreResult<()> {
        let mut event = self.claimed(id)?;
        event.mark_failed(error);
        self.staged.insert(id, event);
        Ok(())
    }

    async fn commit(mut self) -> StoreResult<()> {
        let staged = std::mem::take(&mut self.staged);
        let mut state = self.inner.state.lock().await;
        for (id, event) in staged {
            // Rows deleted while claimed stay deleted.
            if let Some(row) = state.outbox.get_mut(&id) {
                *row = event;
            }
        }
        Ok(())
    }
}

impl Drop for MemoryOutboxClaim {
    fn drop(&mut self) {
        let mut claimed = lock(&self.inner.claimed);
        for event in &self.events {
            claimed.remove(&event.id);
        }
    }
}

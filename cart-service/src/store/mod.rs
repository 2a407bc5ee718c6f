//! Cart and outbox persistence.
//!
//! Cart rows and outbox rows live in the same database, so a [`CartTx`] is
//! also an [`OutboxSink`]: a cart mutation and the event it produces commit
//! together. The relay and the admin surface work through [`OutboxStore`].

mod memory;
mod postgres;

pub use memory::{MemoryCartStore, MemoryCartTx, MemoryOutboxClaim};
pub use postgres::{DbPool, PgCartStore, PgCartTx, PgOutboxClaim};

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::StoreResult;
use crate::models::{CartItem, NewCartItem, NewOutboxEvent, OutboxEvent};

/// Anything an outbox row can be appended through.
#[async_trait]
pub trait OutboxSink: Send {
    async fn insert_outbox(&mut self, event: NewOutboxEvent) -> StoreResult<OutboxEvent>;
}

#[async_trait]
pub trait CartStore: Send + Sync + 'static {
    type Tx: CartTx;

    async fn begin(&self) -> StoreResult<Self::Tx>;

    async fn list_items(&self, user_id: &str) -> StoreResult<Vec<CartItem>>;
}

/// A unit of work over cart rows. Dropping it without `commit` discards
/// every change, outbox rows included.
#[async_trait]
pub trait CartTx: OutboxSink {
    /// Reads and locks one cart line.
    async fn find_item(&mut self, user_id: &str, product_id: &str) -> StoreResult<Option<CartItem>>;

    /// Adds `item.quantity` to the line, creating it when missing. The sum is
    /// computed by the store so concurrent first additions both count.
    async fn increment_item(&mut self, item: NewCartItem) -> StoreResult<CartItem>;

    async fn remove_item(&mut self, user_id: &str, product_id: &str) -> StoreResult<Option<CartItem>>;

    /// Removes and returns every line of the cart.
    async fn clear(&mut self, user_id: &str) -> StoreResult<Vec<CartItem>>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Pending,
    NotFound,
}

#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    type Claim: OutboxClaim;

    /// Claims up to `limit` PENDING rows, plus FAILED rows with fewer than
    /// `max_attempts` attempts, oldest first. Rows claimed by someone else
    /// are skipped, and so is every row queued behind an unsent row of the
    /// same partition key that this claim does not hold.
    async fn claim_batch(&self, limit: i64, max_attempts: i32) -> StoreResult<Self::Claim>;

    /// Claims one row by id whatever its status. `None` when the row is
    /// missing or already claimed.
    async fn claim_one(&self, id: i64) -> StoreResult<Option<Self::Claim>>;

    async fn find(&self, id: i64) -> StoreResult<Option<OutboxEvent>>;

    async fn list_failed(&self) -> StoreResult<Vec<OutboxEvent>>;

    /// Deletes a row unless it is still PENDING.
    async fn delete(&self, id: i64) -> StoreResult<DeleteOutcome>;
}

/// Claimed outbox rows. Status changes become visible on `commit`; dropping
/// the claim releases the rows unchanged.
#[async_trait]
pub trait OutboxClaim: Send {
    fn events(&self) -> &[OutboxEvent];

    async fn mark_sent(&mut self, id: i64) -> StoreResult<()>;

    async fn mark_failed(&mut self, id: i64, error: &str) -> StoreResult<()>;

    async fn commit(self) -> StoreResult<()>;
}

/// Keeps the rows of `claimable` that head their partition key: a row
/// qualifies only when every older unsent row with the same key is claimable
/// too. `backlog` lists `(id, partition_key)` of every unsent row for those
/// keys, oldest first.
fn head_of_line(claimable: Vec<OutboxEvent>, backlog: &[(i64, String)]) -> Vec<OutboxEvent> {
    let ids: HashSet<i64> = claimable.iter().map(|e| e.id).collect();
    let mut blocked: HashSet<&str> = HashSet::new();
    let mut eligible: HashSet<i64> = HashSet::new();
    for (id, key) in backlog {
        if blocked.contains(key.as_str()) {
            continue;
        }
        if ids.contains(id) {
            eligible.insert(*id);
        } else {
            blocked.insert(key.as_str());
        }
    }
    claimable.into_iter().filter(|e| eligible.contains(&e.id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use shared::OutboxStatus;

    fn row(id: i64, key: &str) -> OutboxEvent {
        NewOutboxEvent {
            event_type: "RESERVE_INVENTORY".to_string(),
            payload: json!({}),
            partition_key: key.to_string(),
            status: OutboxStatus::Pending.as_str().to_string(),
        }
        .into_record(id, Utc::now())
    }

    fn backlog(rows: &[(i64, &str)]) -> Vec<(i64, String)> {
        rows.iter().map(|(id, key)| (*id, key.to_string())).collect()
    }

    #[test]
    fn rows_behind_an_unclaimed_row_wait() {
        let claimable = vec![row(2, "u1"), row(3, "u2"), row(4, "u1")];
        let unsent = backlog(&[(1, "u1"), (2, "u1"), (3, "u2"), (4, "u1")]);

        let ids: Vec<i64> = head_of_line(claimable, &unsent).iter().map(|e| e.id).collect();

        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn a_contiguous_run_of_one_key_is_kept() {
        let claimable = vec![row(1, "u1"), row(2, "u1"), row(4, "u1")];
        let unsent = backlog(&[(1, "u1"), (2, "u1"), (3, "u1"), (4, "u1")]);

        let ids: Vec<i64> = head_of_line(claimable, &unsent).iter().map(|e| e.id).collect();

        assert_eq!(ids, vec![1, 2]);
    }
}

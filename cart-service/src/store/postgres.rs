use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use shared::OutboxStatus;

use super::{head_of_line, CartStore, CartTx, DeleteOutcome, OutboxClaim, OutboxSink, OutboxStore};
use crate::error::{StoreError, StoreResult};
use crate::models::{CartItem, NewCartItem, NewOutboxEvent, OutboxEvent};
use crate::schema::{cart_items, outbox_events};

pub type DbPool = Pool<AsyncPgConnection>;

type PooledConn = bb8::PooledConnection<'static, AsyncDieselConnectionManager<AsyncPgConnection>>;

#[derive(Clone)]
pub struct PgCartStore {
    pool: DbPool,
}

pub struct PgCartTx {
    conn: PooledConn,
}

/// Outbox rows locked with `FOR UPDATE SKIP LOCKED` inside an open
/// transaction. Other relays skip them until this claim commits.
pub struct PgOutboxClaim {
    conn: PooledConn,
    events: Vec<OutboxEvent>,
}

impl PgCartStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn begin_transaction(&self) -> StoreResult<PooledConn> {
        let mut conn = self.pool.get_owned().await.map_err(pool_error)?;
        AnsiTransactionManager::begin_transaction(&mut *conn).await?;
        Ok(conn)
    }
}

fn pool_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Pool(e.to_string())
}

#[async_trait]
impl CartStore for PgCartStore {
    type Tx = PgCartTx;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        Ok(PgCartTx {
            conn: self.begin_transaction().await?,
        })
    }

    async fn list_items(&self, user_id: &str) -> StoreResult<Vec<CartItem>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let items = cart_items::table
            .filter(cart_items::user_id.eq(user_id))
            .order(cart_items::product_id.asc())
            .select(CartItem::as_select())
            .load(&mut conn)
            .await?;
        Ok(items)
    }
}

#[async_trait]
impl OutboxSink for PgCartTx {
    async fn insert_outbox(&mut self, event: NewOutboxEvent) -> StoreResult<OutboxEvent> {
        let record = diesel::insert_into(outbox_events::table)
            .values(&event)
            .returning(OutboxEvent::as_returning())
            .get_result(&mut *self.conn)
            .await?;
        Ok(record)
    }
}

#[async_trait]
impl CartTx for PgCartTx {
    async fn find_item(&mut self, user_id: &str, product_id: &str) -> StoreResult<Option<CartItem>> {
        let item = cart_items::table
            .find((user_id, product_id))
            .for_update()
            .select(CartItem::as_select())
            .first(&mut *self.conn)
            .await
            .optional()?;
        Ok(item)
    }

    async fn increment_item(&mut self, item: NewCartItem) -> StoreResult<CartItem> {
        let record = diesel::insert_into(cart_items::table)
            .values(&item)
            .on_conflict((cart_items::user_id, cart_items::product_id))
            .do_update()
            .set((
                cart_items::quantity.eq(cart_items::quantity + excluded(cart_items::quantity)),
                cart_items::price.eq(excluded(cart_items::price)),
                cart_items::updated_at.eq(Some(Utc::now())),
            ))
            .returning(CartItem::as_returning())
            .get_result(&mut *self.conn)
            .await?;
        Ok(record)
    }

    async fn remove_item(&mut self, user_id: &str, product_id: &str) -> StoreResult<Option<CartItem>> {
        let removed = diesel::delete(cart_items::table.find((user_id, product_id)))
            .returning(CartItem::as_returning())
            .get_result(&mut *self.conn)
            .await
            .optional()?;
        Ok(removed)
    }

    async fn clear(&mut self, user_id: &str) -> StoreResult<Vec<CartItem>> {
        let removed = diesel::delete(cart_items::table.filter(cart_items::user_id.eq(user_id)))
            .returning(CartItem::as_returning())
            .get_results(&mut *self.conn)
            .await?;
        Ok(removed)
    }

    async fn commit(mut self) -> StoreResult<()> {
        AnsiTransactionManager::commit_transaction(&mut *self.conn).await?;
        Ok(())
    }

    async fn rollback(mut self) -> StoreResult<()> {
        AnsiTransactionManager::rollback_transaction(&mut *self.conn).await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgCartStore {
    type Claim = PgOutboxClaim;

    async fn claim_batch(&self, limit: i64, max_attempts: i32) -> StoreResult<Self::Claim> {
        let mut conn = self.begin_transaction().await?;
        // Keys whose oldest unsent row ran out of attempts wait for an operator.
        let exhausted: Vec<String> = outbox_events::table
            .filter(outbox_events::status.eq(OutboxStatus::Failed.as_str()))
            .filter(outbox_events::attempts.ge(max_attempts))
            .select(outbox_events::partition_key)
            .distinct()
            .load(&mut *conn)
            .await?;
        let candidates = outbox_events::table
            .filter(
                outbox_events::status.eq(OutboxStatus::Pending.as_str()).or(outbox_events::status
                    .eq(OutboxStatus::Failed.as_str())
                    .and(outbox_events::attempts.lt(max_attempts))),
            )
            .filter(outbox_events::partition_key.ne_all(&exhausted))
            .order((outbox_events::created_at.asc(), outbox_events::id.asc()))
            .limit(limit)
            .for_update()
            .skip_locked()
            .select(OutboxEvent::as_select())
            .load(&mut *conn)
            .await?;

        let keys: Vec<String> = candidates.iter().map(|e| e.partition_key.clone()).collect();
        let backlog: Vec<(i64, String)> = outbox_events::table
            .filter(outbox_events::partition_key.eq_any(&keys))
            .filter(outbox_events::status.ne(OutboxStatus::Sent.as_str()))
            .order((outbox_events::created_at.asc(), outbox_events::id.asc()))
            .select((outbox_events::id, outbox_events::partition_key))
            .load(&mut *conn)
            .await?;
        let events = head_of_line(candidates, &backlog);
        Ok(PgOutboxClaim { conn, events })
    }

    async fn claim_one(&self, id: i64) -> StoreResult<Option<Self::Claim>> {
        let mut conn = self.begin_transaction().await?;
        let event = outbox_events::table
            .find(id)
            .for_update()
            .skip_locked()
            .select(OutboxEvent::as_select())
            .first(&mut *conn)
            .await
            .optional()?;
        match event {
            Some(event) => Ok(Some(PgOutboxClaim {
                conn,
                events: vec![event],
            })),
            None => {
                AnsiTransactionManager::rollback_transaction(&mut *conn).await?;
                Ok(None)
            }
        }
    }

    async fn find(&self, id: i64) -> StoreResult<Option<OutboxEvent>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let event = outbox_events::table
            .find(id)
            .select(OutboxEvent::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(event)
    }

    async fn list_failed(&self) -> StoreResult<Vec<OutboxEvent>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let events = outbox_events::table
            .filter(outbox_events::status.eq(OutboxStatus::Failed.as_str()))
            .order((outbox_events::created_at.asc(), outbox_events::id.asc()))
            .select(OutboxEvent::as_select())
            .load(&mut conn)
            .await?;
        Ok(events)
    }

    async fn delete(&self, id: i64) -> StoreResult<DeleteOutcome> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let deleted = diesel::delete(
            outbox_events::table
                .filter(outbox_events::id.eq(id))
                .filter(outbox_events::status.ne(OutboxStatus::Pending.as_str())),
        )
        .execute(&mut conn)
        .await?;
        if deleted > 0 {
            return Ok(DeleteOutcome::Deleted);
        }

        let exists = outbox_events::table
            .find(id)
            .select(outbox_events::id)
            .first::<i64>(&mut conn)
            .await
            .optional()?;
        Ok(match exists {
            Some(_) => DeleteOutcome::Pending,
            None => DeleteOutcome::NotFound,
        })
    }
}

impl PgOutboxClaim {
    fn ensure_claimed(&self, id: i64) -> StoreResult<()> {
        if self.events.iter().any(|e| e.id == id) {
            Ok(())
        } else {
            Err(StoreError::NotClaimed(id))
        }
    }
}

#[async_trait]
impl OutboxClaim for PgOutboxClaim {
    fn events(&self) -> &[OutboxEvent] {
        &self.events
    }

    async fn mark_sent(&mut self, id: i64) -> StoreResult<()> {
        self.ensure_claimed(id)?;
        diesel::update(outbox_events::table.find(id))
            .set((
                outbox_events::status.eq(OutboxStatus::Sent.as_str()),
                outbox_events::sent_at.eq(Some(Utc::now())),
                outbox_events::error.eq(None::<String>),
                outbox_events::attempts.eq(outbox_events::attempts + 1),
            ))
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn mark_failed(&mut self, id: i64, error: &str) -> StoreResult<()> {
        self.ensure_claimed(id)?;
        diesel::update(outbox_events::table.find(id))
            .set((
                outbox_events::status.eq(OutboxStatus::Failed.as_str()),
                outbox_events::error.eq(Some(error)),
                outbox_events::attempts.eq(outbox_events::attempts + 1),
            ))
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn commit(mut self) -> StoreResult<()> {
        AnsiTransactionManager::commit_transaction(&mut *self.conn).await?;
        Ok(())
    }
}

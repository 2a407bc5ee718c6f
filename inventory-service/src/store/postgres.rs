use async_trait::async_trait;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{sorted_unique, InventoryStore, InventoryTx};
use crate::error::{StoreError, StoreResult};
use crate::models::{Inventory, InventoryPatch, NewInventory, NewProcessedEvent};
use crate::schema::{inventory, processed_events};

pub type DbPool = Pool<AsyncPgConnection>;

type PooledConn = bb8::PooledConnection<'static, AsyncDieselConnectionManager<AsyncPgConnection>>;

#[derive(Clone)]
pub struct PgInventoryStore {
    pool: DbPool,
    lock_timeout: Duration,
    statement_timeout: Duration,
}

/// An open Postgres transaction on a pooled connection.
///
/// If dropped before `commit`/`rollback` the pool sees an open transaction and
/// discards the connection, so the server rolls it back.
pub struct PgInventoryTx {
    conn: PooledConn,
}

impl PgInventoryStore {
    pub fn new(pool: DbPool, lock_timeout: Duration, statement_timeout: Duration) -> Self {
        Self {
            pool,
            lock_timeout,
            statement_timeout,
        }
    }
}

fn pool_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Pool(e.to_string())
}

#[async_trait]
impl InventoryStore for PgInventoryStore {
    type Tx = PgInventoryTx;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        let mut conn = self.pool.get_owned().await.map_err(pool_error)?;
        AnsiTransactionManager::begin_transaction(&mut *conn).await?;

        diesel::sql_query(format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis()))
            .execute(&mut *conn)
            .await?;
        diesel::sql_query(format!(
            "SET LOCAL statement_timeout = '{}ms'",
            self.statement_timeout.as_millis()
        ))
        .execute(&mut *conn)
        .await?;

        Ok(PgInventoryTx { conn })
    }

    async fn find_by_product_id(&self, product_id: &str) -> StoreResult<Option<Inventory>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let record = inventory::table
            .find(product_id)
            .select(Inventory::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(record)
    }

    async fn find_many(&self, product_ids: &[String]) -> StoreResult<Vec<Inventory>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let records = inventory::table
            .filter(inventory::product_id.eq_any(sorted_unique(product_ids)))
            .order(inventory::product_id.asc())
            .select(Inventory::as_select())
            .load(&mut conn)
            .await?;
        Ok(records)
    }
}

#[async_trait]
impl InventoryTx for PgInventoryTx {
    async fn lock_for_update(&mut self, product_ids: &[String]) -> StoreResult<HashMap<String, Inventory>> {
        let records: Vec<Inventory> = inventory::table
            .filter(inventory::product_id.eq_any(sorted_unique(product_ids)))
            .order(inventory::product_id.asc())
            .for_update()
            .select(Inventory::as_select())
            .load(&mut *self.conn)
            .await?;

        debug!(requested = product_ids.len(), locked = records.len(), "Locked inventory rows");
        Ok(records
            .into_iter()
            .map(|record| (record.product_id.clone(), record))
            .collect())
    }

    async fn update(&mut self, product_id: &str, patch: InventoryPatch) -> StoreResult<Inventory> {
        let mut record = inventory::table
            .find(product_id)
            .for_update()
            .select(Inventory::as_select())
            .first(&mut *self.conn)
            .await
            .optional()?
            .ok_or_else(|| StoreError::MissingRecord(product_id.to_string()))?;

        record.apply(&patch);
        if !record.is_consistent() {
            return Err(StoreError::InvariantViolation {
                product_id: product_id.to_string(),
                total: record.total_quantity,
                reserved: record.reserved_quantity,
            });
        }

        let updated = diesel::update(inventory::table.find(product_id))
            .set(&record.changeset())
            .returning(Inventory::as_returning())
            .get_result(&mut *self.conn)
            .await?;
        Ok(updated)
    }

    async fn create_many(&mut self, mut records: Vec<NewInventory>) -> StoreResult<Vec<Inventory>> {
        records.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        if let Some(bad) = records.iter().find(|r| !r.is_consistent()) {
            return Err(StoreError::InvariantViolation {
                product_id: bad.product_id.clone(),
                total: bad.total_quantity,
                reserved: bad.reserved_quantity,
            });
        }
        let ids: Vec<String> = records.iter().map(|r| r.product_id.clone()).collect();
        let records: Vec<NewInventory> = records.into_iter().map(NewInventory::normalized).collect();

        diesel::insert_into(inventory::table)
            .values(&records)
            .returning(Inventory::as_returning())
            .get_results(&mut *self.conn)
            .await
            .map_err(|e| match e {
                DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                    StoreError::DuplicateRecord(ids.join(","))
                }
                other => StoreError::Database(other),
            })
    }

    async fn delete(&mut self, product_id: &str) -> StoreResult<bool> {
        let deleted = diesel::delete(inventory::table.find(product_id))
            .execute(&mut *self.conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn claim_idempotency_key(&mut self, key: &str, event_type: &str) -> StoreResult<bool> {
        let inserted = diesel::insert_into(processed_events::table)
            .values(&NewProcessedEvent {
                idempotency_key: key.to_string(),
                event_type: event_type.to_string(),
            })
            .on_conflict_do_nothing()
            .execute(&mut *self.conn)
            .await?;
        Ok(inserted == 1)
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

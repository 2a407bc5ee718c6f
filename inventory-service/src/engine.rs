use serde::{Deserialize, Serialize};
use shared::{EventType, InventoryItem, ReleaseMode};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{InventoryError, StoreError};
use crate::models::{Inventory, InventoryPatch, NewInventory};
use crate::store::{InventoryStore, InventoryTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemFailure {
    ProductNotFound,
    InsufficientStock,
    ReleaseExceedsReservation,
    /// The item itself was fine but another item in the batch failed.
    BatchRolledBack,
}

impl ItemFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemFailure::ProductNotFound => "PRODUCT_NOT_FOUND",
            ItemFailure::InsufficientStock => "INSUFFICIENT_STOCK",
            ItemFailure::ReleaseExceedsReservation => "RELEASE_EXCEEDS_RESERVATION",
            ItemFailure::BatchRolledBack => "BATCH_ROLLED_BACK",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub correlation_id: String,
    pub user_id: String,
    pub order_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub items: Vec<InventoryItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReservation {
    pub product_id: String,
    pub reserved: bool,
    pub reason: Option<ItemFailure>,
    pub current_stock: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationResult {
    pub overall_success: bool,
    pub per_item: Vec<ItemReservation>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub correlation_id: String,
    pub user_id: String,
    pub mode: ReleaseMode,
    pub idempotency_key: Option<String>,
    pub items: Vec<InventoryItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRelease {
    pub product_id: String,
    pub released: bool,
    pub reason: Option<ItemFailure>,
    pub current_stock: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResult {
    pub overall_success: bool,
    pub per_item: Vec<ItemRelease>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

#[derive(Debug, Clone)]
pub struct ReplenishRequest {
    pub product_id: String,
    pub quantity: i32,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplenishOutcome {
    Replenished(Inventory),
    /// No record exists; replenishment never creates one.
    NotFound,
    Duplicate,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub transaction_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transaction_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of one item against the working copy of the locked rows.
#[derive(Debug, Clone, PartialEq)]
struct ItemOutcome {
    product_id: String,
    failure: Option<ItemFailure>,
    current_stock: Option<i32>,
}

pub struct InventoryEngine<S> {
    store: S,
    config: EngineConfig,
}

impl ReservationResult {
    fn duplicate() -> Self {
        Self {
            overall_success: true,
            per_item: Vec::new(),
            duplicate: true,
        }
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &ItemReservation> {
        self.per_item
            .iter()
            .filter(|i| !matches!(i.reason, None | Some(ItemFailure::BatchRolledBack)))
    }
}

impl ReleaseResult {
    fn duplicate() -> Self {
        Self {
            overall_success: true,
            per_item: Vec::new(),
            duplicate: true,
        }
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &ItemRelease> {
        self.per_item
            .iter()
            .filter(|i| !matches!(i.reason, None | Some(ItemFailure::BatchRolledBack)))
    }
}

fn check_request(items: &[InventoryItem]) -> Result<(), InventoryError> {
    shared::check_items(items).map_err(InventoryError::InvalidRequest)
}

fn product_ids(items: &[InventoryItem]) -> Vec<String> {
    items.iter().map(|i| i.product_id.clone()).collect()
}

/// Earmarks stock for each item in order. Repeated product lines accumulate.
fn plan_reservation(items: &[InventoryItem], working: &mut HashMap<String, Inventory>) -> Vec<ItemOutcome> {
    items
        .iter()
        .map(|item| match working.get_mut(&item.product_id) {
            None => ItemOutcome {
                product_id: item.product_id.clone(),
                failure: Some(ItemFailure::ProductNotFound),
                current_stock: None,
            },
            Some(record) if record.available() < item.quantity => ItemOutcome {
                product_id: item.product_id.clone(),
                failure: Some(ItemFailure::InsufficientStock),
                current_stock: Some(record.available()),
            },
            Some(record) => {
                let reserved = record.reserved_quantity + item.quantity;
                record.apply(&InventoryPatch {
                    total_quantity: None,
                    reserved_quantity: Some(reserved),
                });
                ItemOutcome {
                    product_id: item.product_id.clone(),
                    failure: None,
                    current_stock: Some(record.available()),
                }
            }
        })
        .collect()
}

fn plan_release(
    items: &[InventoryItem],
    mode: ReleaseMode,
    working: &mut HashMap<String, Inventory>,
) -> Result<Vec<ItemOutcome>, InventoryError> {
    let mut outcomes = Vec::with_capacity(items.len());
    for item in items {
        let outcome = match working.get_mut(&item.product_id) {
            None => ItemOutcome {
                product_id: item.product_id.clone(),
                failure: Some(ItemFailure::ProductNotFound),
                current_stock: None,
            },
            Some(record) if record.reserved_quantity < item.quantity => {
                error!(
                    product_id = %item.product_id,
                    reserved = record.reserved_quantity,
                    requested = item.quantity,
                    "Release exceeds outstanding reservation; upstream state is inconsistent"
                );
                ItemOutcome {
                    product_id: item.product_id.clone(),
                    failure: Some(ItemFailure::ReleaseExceedsReservation),
                    current_stock: Some(record.available()),
                }
            }
            Some(record) => {
                let reserved = record.reserved_quantity - item.quantity;
                let total = match mode {
                    ReleaseMode::Cancel => record.total_quantity,
                    ReleaseMode::Return => record.total_quantity.checked_add(item.quantity).ok_or_else(|| {
                        InventoryError::InvalidRequest(format!(
                            "returning {} units overflows stock of product {}",
                            item.quantity, item.product_id
                        ))
                    })?,
                    ReleaseMode::Finalize => record.total_quantity - item.quantity,
                };
                record.apply(&InventoryPatch::quantities(total, reserved));
                ItemOutcome {
                    product_id: item.product_id.clone(),
                    failure: None,
                    current_stock: Some(record.available()),
                }
            }
        };
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

/// Items that passed are reported as rolled back, with stock as it was
/// before the batch.
fn roll_back_outcomes(outcomes: Vec<ItemOutcome>, before: &HashMap<String, Inventory>) -> Vec<ItemOutcome> {
    outcomes
        .into_iter()
        .map(|outcome| match outcome.failure {
            Some(_) => outcome,
            None => ItemOutcome {
                current_stock: before.get(&outcome.product_id).map(Inventory::available),
                failure: Some(ItemFailure::BatchRolledBack),
                product_id: outcome.product_id,
            },
        })
        .collect()
}

async fn persist_changes<T: InventoryTx>(
    tx: &mut T,
    before: &HashMap<String, Inventory>,
    after: &HashMap<String, Inventory>,
) -> Result<(), InventoryError> {
    let mut changed: Vec<&Inventory> = after
        .values()
        .filter(|record| before.get(&record.product_id) != Some(*record))
        .collect();
    changed.sort_by(|a, b| a.product_id.cmp(&b.product_id));

    for record in changed {
        tx.update(
            &record.product_id,
            InventoryPatch::quantities(record.total_quantity, record.reserved_quantity),
        )
        .await?;
    }
    Ok(())
}

impl<S: InventoryStore> InventoryEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn bounded<T, F>(&self, work: F) -> Result<T, InventoryError>
    where
        F: Future<Output = Result<T, InventoryError>>,
    {
        tokio::time::timeout(self.config.transaction_timeout, work)
            .await
            .map_err(|_| InventoryError::Timeout(self.config.transaction_timeout))?
    }

    /// Reserves every item or none of them.
    pub async fn reserve(&self, request: &ReservationRequest) -> Result<ReservationResult, InventoryError> {
        check_request(&request.items)?;
        self.bounded(self.reserve_in_tx(request)).await
    }

    async fn reserve_in_tx(&self, request: &ReservationRequest) -> Result<ReservationResult, InventoryError> {
        let mut tx = self.store.begin().await?;
        let mut working = tx.lock_for_update(&product_ids(&request.items)).await?;

        if let Some(key) = &request.idempotency_key {
            if !tx.claim_idempotency_key(key, EventType::ReserveInventory.as_str()).await? {
                tx.rollback().await?;
                info!(
                    correlation_id = %request.correlation_id,
                    idempotency_key = %key,
                    "Reservation already processed, skipping"
                );
                return Ok(ReservationResult::duplicate());
            }
        }

        let before = working.clone();
        let outcomes = plan_reservation(&request.items, &mut working);

        if outcomes.iter().any(|o| o.failure.is_some()) {
            tx.rollback().await?;
            let per_item: Vec<ItemReservation> = roll_back_outcomes(outcomes, &before)
                .into_iter()
                .map(|o| ItemReservation {
                    product_id: o.product_id,
                    reserved: false,
                    reason: o.failure,
                    current_stock: o.current_stock,
                })
                .collect();
            warn!(
                correlation_id = %request.correlation_id,
                user_id = %request.user_id,
                "Reservation rejected, batch rolled back"
            );
            return Ok(ReservationResult {
                overall_success: false,
                per_item,
                duplicate: false,
            });
        }

        persist_changes(&mut tx, &before, &working).await?;
        tx.commit().await?;

        info!(
            correlation_id = %request.correlation_id,
            user_id = %request.user_id,
            order_id = ?request.order_id,
            items = request.items.len(),
            "Inventory reserved"
        );

        Ok(ReservationResult {
            overall_success: true,
            per_item: outcomes
                .into_iter()
                .map(|o| ItemReservation {
                    product_id: o.product_id,
                    reserved: true,
                    reason: None,
                    current_stock: o.current_stock,
                })
                .collect(),
            duplicate: false,
        })
    }

    /// Reverses reserved quantity for every item or none of them.
    pub async fn release(&self, request: &ReleaseRequest) -> Result<ReleaseResult, InventoryError> {
        check_request(&request.items)?;
        self.bounded(self.release_in_tx(request)).await
    }

    async fn release_in_tx(&self, request: &ReleaseRequest) -> Result<ReleaseResult, InventoryError> {
        let mut tx = self.store.begin().await?;
        let mut working = tx.lock_for_update(&product_ids(&request.items)).await?;

        if let Some(key) = &request.idempotency_key {
            if !tx.claim_idempotency_key(key, EventType::ReleaseInventory.as_str()).await? {
                tx.rollback().await?;
                info!(
                    correlation_id = %request.correlation_id,
                    idempotency_key = %key,
                    "Release already processed, skipping"
                );
                return Ok(ReleaseResult::duplicate());
            }
        }

        let before = working.clone();
        let outcomes = plan_release(&request.items, request.mode, &mut working)?;

        if outcomes.iter().any(|o| o.failure.is_some()) {
            tx.rollback().await?;
            warn!(
                correlation_id = %request.correlation_id,
                mode = ?request.mode,
                "Release rejected, batch rolled back"
            );
            return Ok(ReleaseResult {
                overall_success: false,
                per_item: roll_back_outcomes(outcomes, &before)
                    .into_iter()
                    .map(|o| ItemRelease {
                        product_id: o.product_id,
                        released: false,
                        reason: o.failure,
                        current_stock: o.current_stock,
                    })
                    .collect(),
                duplicate: false,
            });
        }

        persist_changes(&mut tx, &before, &working).await?;
        tx.commit().await?;

        info!(
            correlation_id = %request.correlation_id,
            mode = ?request.mode,
            items = request.items.len(),
            "Inventory released"
        );

        Ok(ReleaseResult {
            overall_success: true,
            per_item: outcomes
                .into_iter()
                .map(|o| ItemRelease {
                    product_id: o.product_id,
                    released: true,
                    reason: None,
                    current_stock: o.current_stock,
                })
                .collect(),
            duplicate: false,
        })
    }

    pub async fn replenish(&self, request: &ReplenishRequest) -> Result<ReplenishOutcome, InventoryError> {
        if request.product_id.trim().is_empty() {
            return Err(InventoryError::InvalidRequest("productId must not be empty".to_string()));
        }
        if request.quantity <= 0 {
            return Err(InventoryError::InvalidRequest(format!(
                "replenish quantity must be positive, got {}",
                request.quantity
            )));
        }
        self.bounded(self.replenish_in_tx(request)).await
    }

    async fn replenish_in_tx(&self, request: &ReplenishRequest) -> Result<ReplenishOutcome, InventoryError> {
        let mut tx = self.store.begin().await?;
        let locked = tx.lock_for_update(&[request.product_id.clone()]).await?;

        let Some(current) = locked.get(&request.product_id) else {
            tx.rollback().await?;
            warn!("No inventory record for product {}, ignoring replenishment", request.product_id);
            return Ok(ReplenishOutcome::NotFound);
        };

        if let Some(key) = &request.idempotency_key {
            if !tx.claim_idempotency_key(key, EventType::ReplenishInventory.as_str()).await? {
                tx.rollback().await?;
                info!("Replenishment {} already processed, skipping", key);
                return Ok(ReplenishOutcome::Duplicate);
            }
        }

        let total = current.total_quantity.checked_add(request.quantity).ok_or_else(|| {
            InventoryError::InvalidRequest(format!(
                "replenishing {} units overflows stock of product {}",
                request.quantity, request.product_id
            ))
        })?;
        let updated = tx
            .update(
                &request.product_id,
                InventoryPatch {
                    total_quantity: Some(total),
                    reserved_quantity: None,
                },
            )
            .await?;
        tx.commit().await?;

        if current.available() <= 0 && updated.available() > 0 {
            info!("Product {} is back in stock ({} available)", request.product_id, updated.available());
        } else {
            info!("Replenished product {} by {}", request.product_id, request.quantity);
        }
        Ok(ReplenishOutcome::Replenished(updated))
    }

    /// Creates inventory records for newly onboarded products.
    pub async fn onboard(&self, records: Vec<NewInventory>) -> Result<Vec<Inventory>, InventoryError> {
        if records.is_empty() {
            return Err(InventoryError::InvalidRequest("at least one record is required".to_string()));
        }
        if let Some(bad) = records
            .iter()
            .find(|r| r.product_id.trim().is_empty() || !r.is_consistent())
        {
            return Err(InventoryError::InvalidRequest(format!(
                "invalid inventory record for product '{}'",
                bad.product_id
            )));
        }

        self.bounded(async {
            let mut tx = self.store.begin().await?;
            let created = tx.create_many(records).await.map_err(|e| match e {
                StoreError::DuplicateRecord(id) => {
                    InventoryError::InvalidRequest(format!("inventory for {} already exists", id))
                }
                other => InventoryError::Store(other),
            })?;
            tx.commit().await?;
            info!("Onboarded {} inventory records", created.len());
            Ok::<_, InventoryError>(created)
        })
        .await
    }

    /// Deletes a record; refuses while any quantity is reserved.
    pub async fn decommission(&self, product_id: &str) -> Result<(), InventoryError> {
        self.bounded(async {
            let mut tx = self.store.begin().await?;
            let locked = tx.lock_for_update(&[product_id.to_string()]).await?;
            let Some(record) = locked.get(product_id) else {
                tx.rollback().await?;
                return Err(InventoryError::NotFound(product_id.to_string()));
            };
            if record.reserved_quantity > 0 {
                let reserved = record.reserved_quantity;
                tx.rollback().await?;
                return Err(InventoryError::OutstandingReservations {
                    product_id: product_id.to_string(),
                    reserved,
                });
            }
            tx.delete(product_id).await?;
            tx.commit().await?;
            info!("Decommissioned inventory for product {}", product_id);
            Ok::<(), InventoryError>(())
        })
        .await
    }

    pub async fn get(&self, product_id: &str) -> Result<Inventory, InventoryError> {
        self.store
            .find_by_product_id(product_id)
            .await?
            .ok_or_else(|| InventoryError::NotFound(product_id.to_string()))
    }
}

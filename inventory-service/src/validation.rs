//! Synchronous stock pre-flight.
//!
//! Each check looks at one requested item and the current inventory record
//! for it. Checks run in order and every reason they produce is kept, except
//! that a [`CheckOutcome::Halt`] stops the remaining checks for that item.

use serde::Serialize;
use shared::InventoryItem;
use std::collections::HashMap;

use crate::error::StoreResult;
use crate::models::Inventory;
use crate::store::InventoryStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Pass,
    Reject(String),
    Halt(String),
}

type CheckFn = dyn Fn(&InventoryItem, Option<&Inventory>) -> CheckOutcome + Send + Sync;

pub struct StockCheck {
    name: &'static str,
    run: Box<CheckFn>,
}

impl StockCheck {
    pub fn new<F>(name: &'static str, run: F) -> Self
    where
        F: Fn(&InventoryItem, Option<&Inventory>) -> CheckOutcome + Send + Sync + 'static,
    {
        Self {
            name,
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn quantity() -> Self {
        Self::new("quantity", |item, _| {
            if item.quantity <= 0 {
                CheckOutcome::Reject(format!(
                    "Quantity for product {} must be greater than zero",
                    item.product_id
                ))
            } else {
                CheckOutcome::Pass
            }
        })
    }

    pub fn existence() -> Self {
        Self::new("existence", |item, record| match record {
            Some(_) => CheckOutcome::Pass,
            None => CheckOutcome::Halt(format!("Product {} not found in inventory", item.product_id)),
        })
    }

    pub fn sufficiency() -> Self {
        Self::new("sufficiency", |item, record| match record {
            Some(record) if record.available() < item.quantity => CheckOutcome::Reject(format!(
                "Insufficient stock for product {}: requested {}, available {}",
                item.product_id,
                item.quantity,
                record.available()
            )),
            _ => CheckOutcome::Pass,
        })
    }
}

pub struct ValidationChain {
    checks: Vec<StockCheck>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidItem {
    pub item: InventoryItem,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_items: Option<Vec<InvalidItem>>,
}

impl Default for ValidationChain {
    fn default() -> Self {
        Self::empty()
            .then(StockCheck::quantity())
            .then(StockCheck::existence())
            .then(StockCheck::sufficiency())
    }
}

impl ValidationChain {
    pub fn empty() -> Self {
        Self { checks: Vec::new() }
    }

    pub fn then(mut self, check: StockCheck) -> Self {
        self.checks.push(check);
        self
    }

    /// Inserts `check` ahead of the check called `before`, or appends it.
    pub fn insert_before(mut self, before: &str, check: StockCheck) -> Self {
        let position = self
            .checks
            .iter()
            .position(|c| c.name == before)
            .unwrap_or(self.checks.len());
        self.checks.insert(position, check);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name).collect()
    }

    pub fn reasons_for(&self, item: &InventoryItem, record: Option<&Inventory>) -> Vec<String> {
        let mut reasons = Vec::new();
        for check in &self.checks {
            match (check.run)(item, record) {
                CheckOutcome::Pass => {}
                CheckOutcome::Reject(reason) => reasons.push(reason),
                CheckOutcome::Halt(reason) => {
                    reasons.push(reason);
                    break;
                }
            }
        }
        reasons
    }

    pub fn evaluate(&self, items: &[InventoryItem], snapshot: &HashMap<String, Inventory>) -> ValidationReport {
        let invalid: Vec<InvalidItem> = items
            .iter()
            .filter_map(|item| {
                let reasons = self.reasons_for(item, snapshot.get(&item.product_id));
                (!reasons.is_empty()).then(|| InvalidItem {
                    item: item.clone(),
                    reasons,
                })
            })
            .collect();

        if invalid.is_empty() {
            ValidationReport {
                success: true,
                invalid_items: None,
            }
        } else {
            ValidationReport {
                success: false,
                invalid_items: Some(invalid),
            }
        }
    }
}

/// Loads a non-locking snapshot of the requested products and runs `chain`.
pub async fn validate_items<S: InventoryStore>(
    store: &S,
    chain: &ValidationChain,
    items: &[InventoryItem],
) -> StoreResult<ValidationReport> {
    let ids: Vec<String> = items.iter().map(|i| i.product_id.clone()).collect();
    let snapshot: HashMap<String, Inventory> = store
        .find_many(&ids)
        .await?
        .into_iter()
        .map(|record| (record.product_id.clone(), record))
        .collect();
    Ok(chain.evaluate(items, &snapshot))
}

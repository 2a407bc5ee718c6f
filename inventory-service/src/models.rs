use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InventoryStatus {
    InStock,
    OutOfStock,
}

impl InventoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InventoryStatus::InStock => "IN_STOCK",
            InventoryStatus::OutOfStock => "OUT_OF_STOCK",
        }
    }

    pub fn for_available(available: i32) -> Self {
        if available > 0 {
            InventoryStatus::InStock
        } else {
            InventoryStatus::OutOfStock
        }
    }
}

impl fmt::Display for InventoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::inventory)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    pub product_id: String,
    pub total_quantity: i32,
    pub reserved_quantity: i32,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable, Deserialize)]
#[diesel(table_name = crate::schema::inventory)]
#[serde(rename_all = "camelCase")]
pub struct NewInventory {
    pub product_id: String,
    pub total_quantity: i32,
    #[serde(default)]
    pub reserved_quantity: i32,
    #[serde(skip, default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    InventoryStatus::OutOfStock.as_str().to_string()
}

/// Partial update; `None` fields are left as they are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InventoryPatch {
    pub total_quantity: Option<i32>,
    pub reserved_quantity: Option<i32>,
}

#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = crate::schema::inventory)]
pub struct InventoryChangeset {
    pub total_quantity: i32,
    pub reserved_quantity: i32,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::processed_events)]
pub struct NewProcessedEvent {
    pub idempotency_key: String,
    pub event_type: String,
}

impl Inventory {
    pub fn available(&self) -> i32 {
        self.total_quantity - self.reserved_quantity
    }

    pub fn derived_status(&self) -> InventoryStatus {
        InventoryStatus::for_available(self.available())
    }

    pub fn is_consistent(&self) -> bool {
        self.reserved_quantity >= 0 && self.reserved_quantity <= self.total_quantity
    }

    /// Applies `patch` and recomputes `status`.
    pub fn apply(&mut self, patch: &InventoryPatch) {
        if let Some(total) = patch.total_quantity {
            self.total_quantity = total;
        }
        if let Some(reserved) = patch.reserved_quantity {
            self.reserved_quantity = reserved;
        }
        self.status = self.derived_status().as_str().to_string();
    }

    pub fn changeset(&self) -> InventoryChangeset {
        InventoryChangeset {
            total_quantity: self.total_quantity,
            reserved_quantity: self.reserved_quantity,
            status: self.derived_status().as_str().to_string(),
            updated_at: Utc::now(),
        }
    }
}

impl NewInventory {
    pub fn new(product_id: impl Into<String>, total_quantity: i32) -> Self {
        Self {
            product_id: product_id.into(),
            total_quantity,
            reserved_quantity: 0,
            status: InventoryStatus::for_available(total_quantity).as_str().to_string(),
        }
    }

    /// Recomputes the status column from the quantities being inserted.
    pub fn normalized(mut self) -> Self {
        self.status = InventoryStatus::for_available(self.total_quantity - self.reserved_quantity)
            .as_str()
            .to_string();
        self
    }

    pub fn is_consistent(&self) -> bool {
        self.total_quantity >= 0
            && self.reserved_quantity >= 0
            && self.reserved_quantity <= self.total_quantity
    }

    pub fn into_record(self, now: DateTime<Utc>) -> Inventory {
        let mut record = Inventory {
            product_id: self.product_id,
            total_quantity: self.total_quantity,
            reserved_quantity: self.reserved_quantity,
            status: self.status,
            created_at: Some(now),
            updated_at: Some(now),
        };
        record.status = record.derived_status().as_str().to_string();
        record
    }
}

impl InventoryPatch {
    pub fn quantities(total_quantity: i32, reserved_quantity: i32) -> Self {
        Self {
            total_quantity: Some(total_quantity),
            reserved_quantity: Some(reserved_quantity),
        }
    }
}

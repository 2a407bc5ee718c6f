use std::time::Duration;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("timed out waiting for the row lock on product {0}")]
    LockTimeout(String),

    #[error("no inventory record for product {0}")]
    MissingRecord(String),

    #[error("inventory record for product {0} already exists")]
    DuplicateRecord(String),

    #[error("inventory invariant violated for product {product_id}: total {total}, reserved {reserved}")]
    InvariantViolation {
        product_id: String,
        total: i32,
        reserved: i32,
    },
}

impl StoreError {
    /// Errors worth retrying once the database or pool recovers.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Pool(_) | StoreError::LockTimeout(_) => true,
            StoreError::Database(e) => matches!(
                e,
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::SerializationFailure
                        | diesel::result::DatabaseErrorKind::ClosedConnection
                        | diesel::result::DatabaseErrorKind::Unknown,
                    _
                ) | diesel::result::Error::BrokenTransactionManager
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("product {0} not found")]
    NotFound(String),

    #[error("product {product_id} still has {reserved} reserved units")]
    OutstandingReservations { product_id: String, reserved: i32 },

    #[error("unit of work did not finish within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl InventoryError {
    pub fn is_transient(&self) -> bool {
        match self {
            InventoryError::Timeout(_) => true,
            InventoryError::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            InventoryError::InvalidRequest(_) => "INVALID_REQUEST",
            InventoryError::NotFound(_) => "NOT_FOUND",
            InventoryError::OutstandingReservations { .. } => "OUTSTANDING_RESERVATIONS",
            InventoryError::Timeout(_) => "TRANSIENT_INFRA",
            InventoryError::Store(e) if e.is_transient() => "TRANSIENT_INFRA",
            InventoryError::Store(_) => "STORE_ERROR",
        }
    }
}

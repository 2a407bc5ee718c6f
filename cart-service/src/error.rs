use std::time::Duration;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("outbox event {0} is not part of this claim")]
    NotClaimed(i64),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        use diesel::result::{DatabaseErrorKind, Error as DieselError};
        match self {
            StoreError::Pool(_) => true,
            StoreError::Database(DieselError::DatabaseError(kind, _)) => matches!(
                kind,
                DatabaseErrorKind::SerializationFailure
                    | DatabaseErrorKind::ClosedConnection
                    | DatabaseErrorKind::UnableToSendCommand
            ),
            StoreError::Database(_) | StoreError::NotClaimed(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no topic for event type {0}")]
    UnknownEventType(String),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PublishError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Timeout(_) | PublishError::Broker(_))
    }
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox event {0} not found")]
    NotFound(i64),

    #[error("outbox event {id} is {status}")]
    InvalidState { id: i64, status: String },

    #[error("outbox event {0} is being published")]
    InFlight(i64),

    #[error("event payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OutboxError {
    pub fn is_transient(&self) -> bool {
        match self {
            OutboxError::InFlight(_) => true,
            OutboxError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum CartError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("product {product_id} is not in the cart of user {user_id}")]
    NotFound { user_id: String, product_id: String },

    #[error("insufficient stock: {}", .0.join("; "))]
    InsufficientStock(Vec<String>),

    #[error("inventory service unavailable: {0}")]
    InventoryUnavailable(String),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CartError {
    pub fn is_transient(&self) -> bool {
        match self {
            CartError::InventoryUnavailable(_) => true,
            CartError::Outbox(e) => e.is_transient(),
            CartError::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CartError::InvalidRequest(_) => "INVALID_REQUEST",
            CartError::NotFound { .. } => "NOT_FOUND",
            CartError::InsufficientStock(_) => "INSUFFICIENT_STOCK",
            e if e.is_transient() => "TRANSIENT_INFRA",
            _ => "INTERNAL",
        }
    }
}

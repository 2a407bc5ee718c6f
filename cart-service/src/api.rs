use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

use crate::cart::{AddItem, CartService, CheckoutReceipt};
use crate::error::{CartError, OutboxError};
use crate::inventory_client::StockValidator;
use crate::models::{CartItem, OutboxEvent};
use crate::outbox::OutboxAdmin;
use crate::publisher::EventPublisher;
use crate::store::{CartStore, OutboxStore};

pub struct AppState<S, V: ?Sized, P: ?Sized> {
    pub cart: Arc<CartService<S, V>>,
    pub admin: Arc<OutboxAdmin<S, P>>,
}

impl<S, V: ?Sized, P: ?Sized> Clone for AppState<S, V, P> {
    fn clone(&self) -> Self {
        Self {
            cart: Arc::clone(&self.cart),
            admin: Arc::clone(&self.admin),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn cart_error(e: CartError) -> ApiError {
    let status = match &e {
        CartError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        CartError::NotFound { .. } => StatusCode::NOT_FOUND,
        CartError::InsufficientStock(_) => StatusCode::CONFLICT,
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Cart request failed: {}", e);
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: e.code(),
        }),
    )
}

fn outbox_error(e: OutboxError) -> ApiError {
    let (status, code) = match &e {
        OutboxError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        OutboxError::InvalidState { .. } | OutboxError::InFlight(_) => (StatusCode::CONFLICT, "INVALID_STATE"),
        e if e.is_transient() => (StatusCode::SERVICE_UNAVAILABLE, "TRANSIENT_INFRA"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    };
    if status.is_server_error() {
        error!("Outbox admin request failed: {}", e);
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code,
        }),
    )
}

pub fn create_router<S, V, P>(state: AppState<S, V, P>) -> Router
where
    S: CartStore + OutboxStore,
    V: StockValidator + ?Sized,
    P: EventPublisher + ?Sized,
{
    Router::new()
        .route("/carts/:user_id", get(get_cart::<S, V, P>).delete(clear_cart::<S, V, P>))
        .route("/carts/:user_id/items", post(add_item::<S, V, P>))
        .route("/carts/:user_id/items/:product_id", delete(remove_item::<S, V, P>))
        .route("/carts/:user_id/checkout", post(checkout::<S, V, P>))
        .route("/admin/outbox/failed", get(list_failed::<S, V, P>))
        .route("/admin/outbox/:id/retry", post(retry_event::<S, V, P>))
        .route("/admin/outbox/:id", delete(delete_event::<S, V, P>))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn get_cart<S, V, P>(
    State(state): State<AppState<S, V, P>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<CartItem>>, ApiError>
where
    S: CartStore + OutboxStore,
    V: StockValidator + ?Sized,
    P: EventPublisher + ?Sized,
{
    state.cart.get_cart(&user_id).await.map(Json).map_err(cart_error)
}

pub async fn add_item<S, V, P>(
    State(state): State<AppState<S, V, P>>,
    Path(user_id): Path<String>,
    Json(request): Json<AddItem>,
) -> Result<(StatusCode, Json<CartItem>), ApiError>
where
    S: CartStore + OutboxStore,
    V: StockValidator + ?Sized,
    P: EventPublisher + ?Sized,
{
    let item = state.cart.add_item(&user_id, request).await.map_err(cart_error)?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn remove_item<S, V, P>(
    State(state): State<AppState<S, V, P>>,
    Path((user_id, product_id)): Path<(String, String)>,
) -> Result<Json<CartItem>, ApiError>
where
    S: CartStore + OutboxStore,
    V: StockValidator + ?Sized,
    P: EventPublisher + ?Sized,
{
    state
        .cart
        .remove_item(&user_id, &product_id)
        .await
        .map(Json)
        .map_err(cart_error)
}

pub async fn clear_cart<S, V, P>(
    State(state): State<AppState<S, V, P>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<CartItem>>, ApiError>
where
    S: CartStore + OutboxStore,
    V: StockValidator + ?Sized,
    P: EventPublisher + ?Sized,
{
    state.cart.clear_cart(&user_id).await.map(Json).map_err(cart_error)
}

pub async fn checkout<S, V, P>(
    State(state): State<AppState<S, V, P>>,
    Path(user_id): Path<String>,
) -> Result<Json<CheckoutReceipt>, ApiError>
where
    S: CartStore + OutboxStore,
    V: StockValidator + ?Sized,
    P: EventPublisher + ?Sized,
{
    state.cart.checkout(&user_id).await.map(Json).map_err(cart_error)
}

pub async fn list_failed<S, V, P>(
    State(state): State<AppState<S, V, P>>,
) -> Result<Json<Vec<OutboxEvent>>, ApiError>
where
    S: CartStore + OutboxStore,
    V: StockValidator + ?Sized,
    P: EventPublisher + ?Sized,
{
    state.admin.list_failed().await.map(Json).map_err(outbox_error)
}

pub async fn retry_event<S, V, P>(
    State(state): State<AppState<S, V, P>>,
    Path(id): Path<i64>,
) -> Result<Json<OutboxEvent>, ApiError>
where
    S: CartStore + OutboxStore,
    V: StockValidator + ?Sized,
    P: EventPublisher + ?Sized,
{
    state.admin.retry(id).await.map(Json).map_err(outbox_error)
}

pub async fn delete_event<S, V, P>(
    State(state): State<AppState<S, V, P>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError>
where
    S: CartStore + OutboxStore,
    V: StockValidator + ?Sized,
    P: EventPublisher + ?Sized,
{
    state
        .admin
        .delete(id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(outbox_error)
}

pub async fn health_check() -> &'static str {
    "OK"
}

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use shared::InventoryItem;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::engine::{InventoryEngine, ReservationRequest, ReservationResult};
use crate::error::InventoryError;
use crate::metrics::{ConsumerMetrics, MetricsSnapshot};
use crate::models::{Inventory, NewInventory};
use crate::store::InventoryStore;
use crate::validation::{validate_items, ValidationChain, ValidationReport};

pub struct AppState<S> {
    pub engine: Arc<InventoryEngine<S>>,
    pub chain: Arc<ValidationChain>,
    pub metrics: Arc<ConsumerMetrics>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            chain: Arc::clone(&self.chain),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequestBody {
    pub order_id: Option<String>,
    pub user_id: String,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub items: Vec<InventoryItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryView {
    #[serde(flatten)]
    pub record: Inventory,
    pub available_quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub consumer: MetricsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

impl From<Inventory> for InventoryView {
    fn from(record: Inventory) -> Self {
        Self {
            available_quantity: record.available(),
            record,
        }
    }
}

fn error_response(e: InventoryError) -> ApiError {
    let status = match &e {
        InventoryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        InventoryError::NotFound(_) => StatusCode::NOT_FOUND,
        InventoryError::OutstandingReservations { .. } => StatusCode::CONFLICT,
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Inventory request failed: {}", e);
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: e.code(),
        }),
    )
}

pub fn create_router<S: InventoryStore>(state: AppState<S>) -> Router {
    Router::new()
        .route("/inventory", post(onboard::<S>))
        .route("/inventory/validate", post(validate::<S>))
        .route("/inventory/reserve", post(reserve::<S>))
        .route(
            "/inventory/:product_id",
            get(get_inventory::<S>).delete(decommission::<S>),
        )
        .route("/health", get(health_check::<S>))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn validate<S: InventoryStore>(
    State(state): State<AppState<S>>,
    Json(items): Json<Vec<InventoryItem>>,
) -> Result<Json<ValidationReport>, ApiError> {
    if items.is_empty() {
        return Err(error_response(InventoryError::InvalidRequest(
            "at least one item is required".to_string(),
        )));
    }
    validate_items(state.engine.store(), &state.chain, &items)
        .await
        .map(Json)
        .map_err(|e| error_response(e.into()))
}

pub async fn reserve<S: InventoryStore>(
    State(state): State<AppState<S>>,
    Json(body): Json<ReserveRequestBody>,
) -> Result<Json<ReservationResult>, ApiError> {
    let request = ReservationRequest {
        correlation_id: body.correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        user_id: body.user_id,
        order_id: body.order_id,
        idempotency_key: body.idempotency_key,
        items: body.items,
    };
    state.engine.reserve(&request).await.map(Json).map_err(error_response)
}

pub async fn onboard<S: InventoryStore>(
    State(state): State<AppState<S>>,
    Json(records): Json<Vec<NewInventory>>,
) -> Result<(StatusCode, Json<Vec<InventoryView>>), ApiError> {
    let records = records.into_iter().map(NewInventory::normalized).collect();
    let created = state.engine.onboard(records).await.map_err(error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(created.into_iter().map(InventoryView::from).collect()),
    ))
}

pub async fn get_inventory<S: InventoryStore>(
    State(state): State<AppState<S>>,
    Path(product_id): Path<String>,
) -> Result<Json<InventoryView>, ApiError> {
    state
        .engine
        .get(&product_id)
        .await
        .map(|record| Json(record.into()))
        .map_err(error_response)
}

pub async fn decommission<S: InventoryStore>(
    State(state): State<AppState<S>>,
    Path(product_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .decommission(&product_id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(error_response)
}

pub async fn health_check<S: InventoryStore>(State(state): State<AppState<S>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        consumer: state.metrics.snapshot(),
    })
}

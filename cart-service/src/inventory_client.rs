use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use shared::InventoryItem;
use std::time::Duration;
use tracing::warn;

use crate::error::CartError;

#[derive(Debug, Clone, Deserialize)]
pub struct RejectedItem {
    pub item: InventoryItem,
    pub reasons: Vec<String>,
}

/// Answer of the inventory validation endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReport {
    pub success: bool,
    #[serde(default)]
    pub invalid_items: Vec<RejectedItem>,
}

impl StockReport {
    pub fn reasons(&self) -> Vec<String> {
        self.invalid_items
            .iter()
            .flat_map(|rejected| rejected.reasons.iter().cloned())
            .collect()
    }
}

/// Synchronous stock pre-flight. Nothing is reserved.
#[async_trait]
pub trait StockValidator: Send + Sync + 'static {
    async fn validate(&self, items: &[InventoryItem]) -> Result<StockReport, CartError>;
}

pub struct HttpStockValidator {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

impl HttpStockValidator {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CartError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CartError::InventoryUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StockValidator for HttpStockValidator {
    async fn validate(&self, items: &[InventoryItem]) -> Result<StockReport, CartError> {
        let url = format!("{}/inventory/validate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(items)
            .send()
            .await
            .map_err(|e| CartError::InventoryUnavailable(e.to_string()))?;

        match response.status() {
            StatusCode::OK => response
                .json::<StockReport>()
                .await
                .map_err(|e| CartError::InventoryUnavailable(format!("unreadable validation response: {}", e))),
            StatusCode::BAD_REQUEST => {
                let body = response
                    .json::<ErrorBody>()
                    .await
                    .map(|b| b.error)
                    .unwrap_or_else(|_| "rejected by inventory service".to_string());
                Err(CartError::InvalidRequest(body))
            }
            status => {
                warn!(%status, url = %url, "Stock validation failed");
                Err(CartError::InventoryUnavailable(format!("validation returned {}", status)))
            }
        }
    }
}

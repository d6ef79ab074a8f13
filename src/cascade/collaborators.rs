use crate::hsuf::Product;
use crate::models::{ItemId, Payload};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Failure reported by an external service. The message is kept verbatim
/// and surfaces as the item's `last_error`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct CollaboratorError {
    message: String,
}

impl CollaboratorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// What price research searches on, built from analysis output.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PriceQuery {
    pub title: String,
    pub brand: Option<String>,
    pub condition: Option<String>,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PriceSuggestion {
    pub suggested_price: f64,
    pub currency: String,
    pub comparable_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PersistedRecord {
    pub persisted_id: String,
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, item_id: ItemId, raw: &Payload) -> Result<Product, CollaboratorError>;
}

#[async_trait]
pub trait PricingService: Send + Sync {
    /// Whether a pricing account is connected. When false the stage is
    /// skipped without calling out.
    fn is_connected(&self) -> bool;

    async fn research_price(
        &self,
        item_id: ItemId,
        query: &PriceQuery,
    ) -> Result<PriceSuggestion, CollaboratorError>;
}

#[async_trait]
pub trait PersistenceService: Send + Sync {
    async fn save(
        &self,
        item_id: ItemId,
        payload: &Payload,
    ) -> Result<PersistedRecord, CollaboratorError>;
}

use super::collaborators::{
    AnalysisService, CollaboratorError, PersistenceService, PriceQuery, PricingService,
};
use super::config::{CascadeConfig, FailurePolicy};
use crate::hsuf::Product;
use crate::models::{Payload, Stage, WorkItem};
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

const PLACEHOLDER_TITLES: &[&str] = &["untitled product", "untitled", "unknown item"];

/// Terminal stage failures as they appear in the ledger.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("{0}")]
    AnalysisFailure(String),
    #[error("{0}")]
    PricingUnavailable(String),
    #[error("{0}")]
    PersistenceFailure(String),
}

impl StageError {
    fn for_stage(stage: Stage, message: impl Into<String>) -> Self {
        let message = message.into();
        match stage {
            Stage::Analysis => Self::AnalysisFailure(message),
            Stage::Pricing => Self::PricingUnavailable(message),
            Stage::Persistence => Self::PersistenceFailure(message),
        }
    }
}

#[derive(Debug)]
pub enum StageOutcome {
    /// Stage succeeded; the payload carries the new fields.
    Advance(WorkItem),
    /// Stage did not apply; the item moves on untouched.
    Skip(WorkItem),
    Fail(WorkItem, StageError),
}

impl StageOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Advance(_) => "advance",
            StageOutcome::Skip(_) => "skip",
            StageOutcome::Fail(..) => "fail",
        }
    }
}

/// The three external services a batch talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub analysis: Arc<dyn AnalysisService>,
    pub pricing: Arc<dyn PricingService>,
    pub persistence: Arc<dyn PersistenceService>,
}

/// Runs one stage for one item. Holds no per-item state; everything carried
/// between stages lives on the item.
#[derive(Clone)]
pub struct StageExecutor {
    collaborators: Collaborators,
    config: Arc<CascadeConfig>,
}

impl StageExecutor {
    pub fn new(collaborators: Collaborators, config: Arc<CascadeConfig>) -> Self {
        Self {
            collaborators,
            config,
        }
    }

    pub async fn execute(&self, stage: Stage, item: WorkItem) -> StageOutcome {
        let started = Instant::now();
        let outcome = match stage {
            Stage::Analysis => self.analyze(item).await,
            Stage::Pricing => self.research_price(item).await,
            Stage::Persistence => self.persist(item).await,
        };
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(stage.as_str(), elapsed_ms);
        crate::metrics::stage_outcome(stage.as_str(), outcome.label());
        outcome
    }

    async fn analyze(&self, mut item: WorkItem) -> StageOutcome {
        let call = self
            .collaborators
            .analysis
            .analyze(item.id, &item.payload);
        match self.bounded(Stage::Analysis, call).await {
            Ok(product) => {
                let fields = analysis_fields(&product, &item.payload);
                item.payload.merge(fields);
                StageOutcome::Advance(item)
            }
            Err(err) => self.on_failure(Stage::Analysis, item, err),
        }
    }

    async fn research_price(&self, mut item: WorkItem) -> StageOutcome {
        if !self.config.stage2_enabled {
            return skip(item, "pricing disabled");
        }
        if !self.collaborators.pricing.is_connected() {
            return skip(item, "no pricing account connected");
        }
        let Some(query) = price_query(&item.payload) else {
            return skip(item, "placeholder title");
        };

        let call = self.collaborators.pricing.research_price(item.id, &query);
        match self.bounded(Stage::Pricing, call).await {
            Ok(suggestion)
                if suggestion.comparable_count > 0
                    && suggestion.suggested_price.is_finite()
                    && suggestion.suggested_price > 0.0 =>
            {
                let mut fields = Map::new();
                fields.insert("price".into(), json!(round_two(suggestion.suggested_price)));
                fields.insert("currency".into(), json!(suggestion.currency));
                fields.insert("price_source".into(), json!("research"));
                fields.insert("comparable_count".into(), json!(suggestion.comparable_count));
                item.payload.merge(fields);
                StageOutcome::Advance(item)
            }
            Ok(_) => skip(item, "no comparable listings"),
            Err(err) => self.on_failure(Stage::Pricing, item, err),
        }
    }

    async fn persist(&self, mut item: WorkItem) -> StageOutcome {
        let call = self
            .collaborators
            .persistence
            .save(item.id, &item.payload);
        match self.bounded(Stage::Persistence, call).await {
            Ok(record) => {
                let mut fields = Map::new();
                fields.insert("persisted_id".into(), json!(record.persisted_id));
                fields.insert("persisted_at".into(), json!(Utc::now()));
                item.payload.merge(fields);
                StageOutcome::Advance(item)
            }
            Err(err) => self.on_failure(Stage::Persistence, item, err),
        }
    }

    async fn bounded<T, F>(&self, stage: Stage, call: F) -> Result<T, CollaboratorError>
    where
        F: Future<Output = Result<T, CollaboratorError>>,
    {
        let limit = self.config.timeout(stage);
        match timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::new(format!(
                "{stage} timed out after {}ms",
                limit.as_millis()
            ))),
        }
    }

    fn on_failure(&self, stage: Stage, item: WorkItem, err: CollaboratorError) -> StageOutcome {
        match self.config.failure_policy(stage) {
            FailurePolicy::Terminal => {
                warn!(
                    target = "hermes.cascade",
                    item_id = %item.id,
                    stage = stage.as_str(),
                    error = %err,
                    "stage_failed"
                );
                StageOutcome::Fail(item, StageError::for_stage(stage, err.message()))
            }
            FailurePolicy::SkipStage => {
                warn!(
                    target = "hermes.cascade",
                    item_id = %item.id,
                    stage = stage.as_str(),
                    error = %err,
                    "stage_failure_downgraded_to_skip"
                );
                StageOutcome::Skip(item)
            }
        }
    }
}

fn skip(item: WorkItem, reason: &'static str) -> StageOutcome {
    debug!(target = "hermes.cascade", item_id = %item.id, reason, "stage_skipped");
    StageOutcome::Skip(item)
}

/// Fields analysis contributes. User-entered price, currency and images win
/// over what the model inferred.
fn analysis_fields(product: &Product, existing: &Payload) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("title".into(), json!(truncate(product.name.trim(), 80)));
    if let Some(brand) = product.brand_name() {
        fields.insert("brand".into(), json!(brand));
    }
    if let Some(color) = &product.color {
        fields.insert("color".into(), json!(color));
    }
    if let Some(material) = &product.material {
        fields.insert("material".into(), json!(material));
    }
    if let Some(description) = &product.description {
        fields.insert("description".into(), json!(description));
    }
    if existing.str_field("condition").is_none()
        && let Some(condition) = product.offers.condition()
    {
        fields.insert("condition".into(), json!(condition));
    }
    if existing.price().is_none()
        && let Some(price) = product.offers.best_price()
    {
        fields.insert("price".into(), json!(price));
        fields.insert("price_source".into(), json!("analysis"));
    }
    if existing.str_field("currency").is_none() {
        let currency = product
            .offers
            .priceCurrency
            .clone()
            .unwrap_or_else(|| "USD".into());
        fields.insert("currency".into(), json!(currency));
    }
    if existing.images().is_empty() {
        fields.insert("images".into(), json!(product.image.as_vec()));
    }
    if let Ok(attributes) = serde_json::to_value(product) {
        fields.insert("attributes".into(), attributes);
    }
    fields
}

fn price_query(payload: &Payload) -> Option<PriceQuery> {
    let title = payload.str_field("title")?;
    let lowered = title.to_lowercase();
    if PLACEHOLDER_TITLES.contains(&lowered.as_str()) || lowered.ends_with(" listing") {
        return None;
    }
    Some(PriceQuery {
        title: title.to_string(),
        brand: payload.str_field("brand").map(str::to_string),
        condition: payload.str_field("condition").map(str::to_string),
        currency: payload.str_field("currency").unwrap_or("USD").to_string(),
    })
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

fn round_two(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

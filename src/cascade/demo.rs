//! Offline collaborators so a batch can run end to end without a model
//! gateway, an eBay keyset or a Supabase project.

use super::collaborators::{
    AnalysisService, CollaboratorError, PersistedRecord, PersistenceService, PriceQuery,
    PriceSuggestion, PricingService,
};
use super::config::env_bool;
use super::executor::Collaborators;
use crate::ebay::EbayPriceResearch;
use crate::hsuf::{Product, ingest};
use crate::models::{ItemId, Payload};
use crate::supabase::SupabaseClient;
use async_trait::async_trait;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::{
    collections::hash_map::DefaultHasher,
    env,
    future::Future,
    hash::{Hash, Hasher},
    sync::Arc,
};
use tokio::time::{Duration, sleep};
use tracing::info;

impl Collaborators {
    /// Real services where they are configured, demo ones elsewhere.
    /// `CASCADE_DEMO=1` forces demo collaborators everywhere.
    pub fn from_env() -> Self {
        let demo = env_bool("CASCADE_DEMO").unwrap_or(false);
        let failure_rate = env::var("CASCADE_DEMO_FAILURE_RATE")
            .ok()
            .and_then(|value| value.trim().parse::<f64>().ok())
            .unwrap_or(0.0);

        let analysis: Arc<dyn AnalysisService> = match ingest::LlmAnalyzer::from_env() {
            Some(analyzer) if !demo => Arc::new(analyzer),
            _ => {
                info!(target = "hermes.cascade", failure_rate, "analysis_demo_mode");
                Arc::new(DemoAnalysis::new(failure_rate))
            }
        };
        let pricing: Arc<dyn PricingService> = if demo {
            info!(target = "hermes.cascade", "pricing_demo_mode");
            Arc::new(DemoPricing)
        } else {
            Arc::new(EbayPriceResearch::from_env())
        };
        let persistence: Arc<dyn PersistenceService> = match SupabaseClient::from_env() {
            Some(client) if !demo => Arc::new(client),
            _ => {
                info!(target = "hermes.cascade", "persistence_demo_mode");
                Arc::new(DemoPersistence)
            }
        };

        Self {
            analysis,
            pricing,
            persistence,
        }
    }
}

pub struct DemoAnalysis {
    failure_rate: f64,
}

impl DemoAnalysis {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: if failure_rate.is_finite() {
                failure_rate.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }
}

#[async_trait]
impl AnalysisService for DemoAnalysis {
    async fn analyze(&self, item_id: ItemId, raw: &Payload) -> Result<Product, CollaboratorError> {
        short_pause(40 + jitter(40)).await;
        if self.failure_rate > 0.0 && rand::rng().random::<f64>() < self.failure_rate {
            return Err(CollaboratorError::new("demo analysis failed"));
        }
        let images = raw.images();
        if images.is_empty() {
            return Err(CollaboratorError::new("no images to analyze"));
        }

        let sku = raw
            .str_field("sku")
            .map(str::to_string)
            .unwrap_or_else(|| item_id.simple().to_string());
        let mut product = ingest::fallback_product(&sku, &images);
        if let Some(hint) = raw.str_field("title").or_else(|| raw.str_field("name")) {
            product.name = hint.to_string();
        }
        let mut rng = SmallRng::seed_from_u64(seed_for(&[&product.name, &sku]));
        product.offers.price = Some((rng.random_range(15.0..120.0_f64) * 100.0).round() / 100.0);
        Ok(product)
    }
}

/// Quotes a stable price per title so repeated runs agree with each other.
pub struct DemoPricing;

#[async_trait]
impl PricingService for DemoPricing {
    fn is_connected(&self) -> bool {
        true
    }

    async fn research_price(
        &self,
        _item_id: ItemId,
        query: &PriceQuery,
    ) -> Result<PriceSuggestion, CollaboratorError> {
        short_pause(25 + jitter(25)).await;
        let brand = query.brand.as_deref().unwrap_or_default();
        let mut rng = SmallRng::seed_from_u64(seed_for(&[&query.title, brand]));
        Ok(PriceSuggestion {
            suggested_price: rng.random_range(20.0..180.0),
            currency: query.currency.clone(),
            comparable_count: rng.random_range(0..12),
        })
    }
}

pub struct DemoPersistence;

#[async_trait]
impl PersistenceService for DemoPersistence {
    async fn save(
        &self,
        item_id: ItemId,
        _payload: &Payload,
    ) -> Result<PersistedRecord, CollaboratorError> {
        short_pause(15 + jitter(10)).await;
        Ok(PersistedRecord {
            persisted_id: format!("HER-{}", item_id.simple()),
        })
    }
}

fn seed_for(parts: &[&str]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for part in parts {
        part.to_lowercase().hash(&mut hasher);
    }
    hasher.finish()
}

fn jitter(max_ms: u64) -> u64 {
    rand::rng().random_range(0..=max_ms)
}

fn short_pause(ms: u64) -> impl Future<Output = ()> {
    sleep(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn query(title: &str) -> PriceQuery {
        PriceQuery {
            title: title.into(),
            brand: Some("Levi's".into()),
            condition: None,
            currency: "USD".into(),
        }
    }

    #[tokio::test]
    async fn demo_analysis_uses_title_hint() {
        let analysis = DemoAnalysis::new(0.0);
        let raw = Payload::from(json!({
            "sku": "JKT-7",
            "title": "Levi's trucker jacket",
            "images": ["https://img.example.com/jkt.jpg"],
        }));
        let product = analysis.analyze(Uuid::new_v4(), &raw).await.unwrap();
        assert_eq!(product.name, "Levi's trucker jacket");
        assert_eq!(product.sku.as_deref(), Some("JKT-7"));
        let price = product.offers.price.unwrap();
        assert!((15.0..120.0).contains(&price));
    }

    #[tokio::test]
    async fn demo_analysis_without_hint_keeps_placeholder_title() {
        let analysis = DemoAnalysis::new(0.0);
        let raw = Payload::from(json!({"sku": "X1", "images": "https://img.example.com/a.jpg"}));
        let product = analysis.analyze(Uuid::new_v4(), &raw).await.unwrap();
        assert_eq!(product.name, "X1 listing");
    }

    #[tokio::test]
    async fn demo_analysis_needs_images() {
        let analysis = DemoAnalysis::new(0.0);
        let err = analysis
            .analyze(Uuid::new_v4(), &Payload::from(json!({"sku": "X1"})))
            .await
            .unwrap_err();
        assert_eq!(err.message(), "no images to analyze");
    }

    #[tokio::test]
    async fn demo_analysis_always_fails_at_full_rate() {
        let analysis = DemoAnalysis::new(7.0);
        let raw = Payload::from(json!({"images": ["https://img.example.com/a.jpg"]}));
        assert!(analysis.analyze(Uuid::new_v4(), &raw).await.is_err());
    }

    #[tokio::test]
    async fn demo_pricing_is_stable_per_title() {
        let first = DemoPricing
            .research_price(Uuid::new_v4(), &query("Trucker jacket"))
            .await
            .unwrap();
        let second = DemoPricing
            .research_price(Uuid::new_v4(), &query("trucker JACKET"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert!((20.0..180.0).contains(&first.suggested_price));
        assert!(first.comparable_count < 12);
    }

    #[tokio::test]
    async fn demo_persistence_is_keyed_by_item() {
        let id = Uuid::new_v4();
        let payload = Payload::default();
        let first = DemoPersistence.save(id, &payload).await.unwrap();
        let second = DemoPersistence.save(id, &payload).await.unwrap();
        assert_eq!(first, second);
        assert!(first.persisted_id.starts_with("HER-"));
    }
}

//! Price research against the eBay Browse API using an application token.

use crate::cascade::collaborators::{
    CollaboratorError, PriceQuery, PriceSuggestion, PricingService,
};
use crate::ebay::auth::{AppToken, EbayAuthError, get_app_access_token};
use crate::ebay::config::{BROWSE_SCOPE, EbayCredentials};
use crate::http::build_client;
use crate::models::ItemId;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const SEARCH_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum EbayBrowseError {
    #[error(transparent)]
    Auth(#[from] EbayAuthError),
    #[error("browse request failed: {0}")]
    Request(String),
    #[error("invalid browse response: {0}")]
    Deserialize(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    item_summaries: Vec<ItemSummary>,
}

#[derive(Debug, Deserialize)]
struct ItemSummary {
    price: Option<Amount>,
}

#[derive(Debug, Deserialize)]
struct Amount {
    value: String,
    currency: String,
}

pub struct EbayPriceResearch {
    http: Client,
    credentials: EbayCredentials,
    token: Mutex<Option<AppToken>>,
}

impl EbayPriceResearch {
    pub fn new(credentials: EbayCredentials) -> Self {
        Self {
            http: build_client(),
            credentials,
            token: Mutex::new(None),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EbayCredentials::from_env())
    }

    async fn access_token(&self) -> Result<String, EbayBrowseError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && token.is_fresh()
        {
            return Ok(token.access_token.clone());
        }
        let token = get_app_access_token(&self.http, &self.credentials, &[BROWSE_SCOPE]).await?;
        let access = token.access_token.clone();
        *cached = Some(token);
        Ok(access)
    }

    /// Prices of active listings matching the query, in the query's currency.
    pub async fn comparable_prices(&self, query: &PriceQuery) -> Result<Vec<f64>, EbayBrowseError> {
        let token = self.access_token().await?;
        let keywords = match &query.brand {
            Some(brand) if !query.title.to_lowercase().contains(&brand.to_lowercase()) => {
                format!("{brand} {}", query.title)
            }
            _ => query.title.clone(),
        };
        let mut url = format!(
            "{}?q={}&limit={SEARCH_LIMIT}",
            self.credentials.search_url(),
            urlencoding::encode(&keywords)
        );
        if let Some(filter) = condition_filter(query.condition.as_deref()) {
            url.push_str("&filter=");
            url.push_str(&urlencoding::encode(filter));
        }

        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .header("X-EBAY-C-MARKETPLACE-ID", &self.credentials.marketplace_id)
            .send()
            .await
            .map_err(|err| EbayBrowseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(EbayBrowseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let payload: SearchResponse = response
            .json()
            .await
            .map_err(|err| EbayBrowseError::Deserialize(err.to_string()))?;

        Ok(payload
            .item_summaries
            .into_iter()
            .filter_map(|summary| summary.price)
            .filter(|amount| amount.currency.eq_ignore_ascii_case(&query.currency))
            .filter_map(|amount| amount.value.trim().parse::<f64>().ok())
            .filter(|price| price.is_finite() && *price > 0.0)
            .collect())
    }
}

#[async_trait]
impl PricingService for EbayPriceResearch {
    fn is_connected(&self) -> bool {
        self.credentials.is_complete()
    }

    async fn research_price(
        &self,
        item_id: ItemId,
        query: &PriceQuery,
    ) -> Result<PriceSuggestion, CollaboratorError> {
        let prices = self.comparable_prices(query).await.map_err(|err| {
            warn!(target = "hermes.ebay", item_id = %item_id, error = %err, "price_research_failed");
            CollaboratorError::new(err.to_string())
        })?;
        let suggested_price = median(prices.clone()).unwrap_or(0.0);
        debug!(
            target = "hermes.ebay",
            item_id = %item_id,
            comparables = prices.len(),
            suggested_price,
            "price_research_complete"
        );
        Ok(PriceSuggestion {
            suggested_price,
            currency: query.currency.clone(),
            comparable_count: prices.len(),
        })
    }
}

fn condition_filter(condition: Option<&str>) -> Option<&'static str> {
    match condition?.trim().to_lowercase().as_str() {
        "new" => Some("conditions:{NEW}"),
        "used" | "refurbished" | "damaged" => Some("conditions:{USED}"),
        _ => None,
    }
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

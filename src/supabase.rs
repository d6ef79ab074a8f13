use crate::cascade::collaborators::{CollaboratorError, PersistedRecord, PersistenceService};
use crate::http::build_client;
use crate::models::{ItemId, Payload};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_TABLE: &str = "listing_drafts";

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    table: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// Row shape of the listings table. The full payload rides along as jsonb.
#[derive(Debug, Serialize)]
struct ListingRow<'a> {
    item_id: ItemId,
    sku: Option<&'a str>,
    title: Option<&'a str>,
    price: Option<f64>,
    currency: Option<&'a str>,
    payload: &'a Payload,
    updated_at: chrono::DateTime<Utc>,
}

impl SupabaseClient {
    pub fn new(base_url: &str, service_key: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            table: table.into(),
            http: build_client(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        let table = std::env::var("SUPABASE_LISTINGS_TABLE")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TABLE.to_string());
        Some(Self::new(&base_url, service_key, table))
    }

    /// Inserts or replaces the row for `item_id` and returns its primary key.
    pub async fn upsert_listing(
        &self,
        item_id: ItemId,
        payload: &Payload,
    ) -> Result<String, SupabaseError> {
        let url = format!(
            "{}/rest/v1/{}?on_conflict=item_id",
            self.base_url, self.table
        );
        let row = ListingRow {
            item_id,
            sku: payload.str_field("sku"),
            title: payload.str_field("title"),
            price: payload.price(),
            currency: payload.str_field("currency"),
            payload,
            updated_at: Utc::now(),
        };
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&[row])
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let mut rows: Vec<Value> = response
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))?;
        let row = rows
            .pop()
            .ok_or_else(|| SupabaseError::Deserialize("empty representation".into()))?;
        match row.get("id") {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Ok(item_id.to_string()),
        }
    }
}

#[async_trait]
impl PersistenceService for SupabaseClient {
    async fn save(
        &self,
        item_id: ItemId,
        payload: &Payload,
    ) -> Result<PersistedRecord, CollaboratorError> {
        let persisted_id = self.upsert_listing(item_id, payload).await.map_err(|err| {
            warn!(target = "hermes.supabase", item_id = %item_id, error = %err, "listing_save_failed");
            CollaboratorError::new(err.to_string())
        })?;
        debug!(target = "hermes.supabase", item_id = %item_id, persisted_id = %persisted_id, "listing_saved");
        Ok(PersistedRecord { persisted_id })
    }
}

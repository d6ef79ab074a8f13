use crate::ebay::config::EbayCredentials;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EbayAuthError {
    #[error("missing ebay app credentials in env")]
    MissingCredentials,
    #[error("oauth request failed: {0}")]
    Request(String),
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    7200
}

/// Application token plus the instant after which it should be refreshed.
#[derive(Debug, Clone)]
pub struct AppToken {
    pub access_token: String,
    pub refresh_after: Instant,
}

impl AppToken {
    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.refresh_after
    }
}

pub async fn get_app_access_token(
    http: &Client,
    credentials: &EbayCredentials,
    scopes: &[&str],
) -> Result<AppToken, EbayAuthError> {
    if !credentials.is_complete() {
        return Err(EbayAuthError::MissingCredentials);
    }
    let scope = scopes.join(" ");
    let params = [("grant_type", "client_credentials"), ("scope", scope.as_str())];
    let response = http
        .post(credentials.token_url())
        .basic_auth(&credentials.app_id, Some(&credentials.app_secret))
        .form(&params)
        .send()
        .await
        .map_err(|err| EbayAuthError::Request(err.to_string()))?;

    if !response.status().is_success() {
        return Err(EbayAuthError::Request(format!(
            "HTTP {}",
            response.status()
        )));
    }

    let payload: TokenResponse = response
        .json()
        .await
        .map_err(|err| EbayAuthError::Request(err.to_string()))?;
    // Refresh a minute before eBay expires the token.
    let lifetime = Duration::from_secs(payload.expires_in.saturating_sub(60));
    Ok(AppToken {
        access_token: payload.access_token,
        refresh_after: Instant::now() + lifetime,
    })
}

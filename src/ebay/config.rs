use once_cell::sync::Lazy;
use std::env;

pub static EBAY_ENV: Lazy<String> =
    Lazy::new(|| env::var("EBAY_ENV").unwrap_or_else(|_| "SANDBOX".to_string()));

pub static APP_ID: Lazy<String> =
    Lazy::new(|| env::var("EBAY_APP_ID_PRODUCTION").unwrap_or_default());

pub static APP_SECRET: Lazy<String> =
    Lazy::new(|| env::var("EBAY_CERT_ID_PRODUCTION").unwrap_or_default());

pub static MARKETPLACE_ID: Lazy<String> =
    Lazy::new(|| env::var("EBAY_MARKETPLACE_ID").unwrap_or_else(|_| "EBAY_US".to_string()));

pub static ROOT: Lazy<String> = Lazy::new(|| {
    if EBAY_ENV.as_str().eq_ignore_ascii_case("PROD") {
        "https://api.ebay.com".to_string()
    } else {
        "https://api.sandbox.ebay.com".to_string()
    }
});

/// Scope needed for Browse API searches with an application token.
pub const BROWSE_SCOPE: &str = "https://api.ebay.com/oauth/api_scope";

/// Keyset and endpoint root for one eBay environment.
#[derive(Debug, Clone)]
pub struct EbayCredentials {
    pub app_id: String,
    pub app_secret: String,
    pub root: String,
    pub marketplace_id: String,
}

impl EbayCredentials {
    pub fn from_env() -> Self {
        Self {
            app_id: APP_ID.trim().to_string(),
            app_secret: APP_SECRET.trim().to_string(),
            root: ROOT.clone(),
            marketplace_id: MARKETPLACE_ID.clone(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.app_id.is_empty() && !self.app_secret.is_empty()
    }

    pub fn token_url(&self) -> String {
        format!("{}/identity/v1/oauth2/token", self.root)
    }

    pub fn search_url(&self) -> String {
        format!("{}/buy/browse/v1/item_summary/search", self.root)
    }
}

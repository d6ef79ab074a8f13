use crate::cascade::collaborators::{AnalysisService, CollaboratorError};
use crate::hsuf::models::{Brand, ImageField, Offer, Product, QuantitativeValue};
use crate::llm::{LlmClient, LlmConfig, LlmMessage};
use crate::models::{ItemId, Payload};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = r#"
You are a resale listing analysis agent. Given photos of a single second-hand item and any notes the seller
typed, respond with a valid JSON object that conforms to schema.org Product. Include `name` (a concise title a
buyer would search for), `brand`, `color`, `material`, `description`, `image` and `offers` with a fair resale
`price`, `priceCurrency` and `itemCondition`. Add dimensions and weight when they can be judged from the photos. If uncertain,
make the best reasonable assumption and say so in the description. Output JSON only.
"#;

/// Images beyond this count are not sent to the model.
const MAX_IMAGES: usize = 6;

const USED_CONDITION: &str = "https://schema.org/UsedCondition";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no images to analyze")]
    NoImages,
    #[error("llm request failed: {0}")]
    Llm(String),
    #[error("unable to parse product json: {0}")]
    Parse(String),
}

/// Vision analysis backed by the TensorZero gateway.
pub struct LlmAnalyzer {
    llm: LlmClient,
}

impl LlmAnalyzer {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    pub fn from_env() -> Option<Self> {
        LlmConfig::from_env().map(|config| Self::new(LlmClient::new(config)))
    }
}

#[async_trait]
impl AnalysisService for LlmAnalyzer {
    async fn analyze(&self, item_id: ItemId, raw: &Payload) -> Result<Product, CollaboratorError> {
        let sku = raw
            .str_field("sku")
            .map(str::to_string)
            .unwrap_or_else(|| item_id.simple().to_string());
        let images = raw.images();
        let product = infer_product(&self.llm, &sku, &images, &seller_notes(raw))
            .await
            .map_err(|err| {
                warn!(target = "hermes.llm", item_id = %item_id, error = %err, "analysis_failed");
                CollaboratorError::new(err.to_string())
            })?;
        debug!(target = "hermes.llm", item_id = %item_id, name = %product.name, "analysis_complete");
        Ok(product)
    }
}

/// Free-text fields the seller filled in, passed to the model as hints.
fn seller_notes(raw: &Payload) -> Map<String, Value> {
    ["title", "name", "brand", "condition", "notes", "description"]
        .iter()
        .filter_map(|key| raw.str_field(key).map(|v| (key.to_string(), json!(v))))
        .collect()
}

pub async fn infer_product(
    llm: &LlmClient,
    sku: &str,
    images: &[String],
    notes: &Map<String, Value>,
) -> Result<Product, IngestError> {
    if images.is_empty() {
        return Err(IngestError::NoImages);
    }

    let payload = json!({
        "sku": sku,
        "images": images.iter().take(MAX_IMAGES).collect::<Vec<_>>(),
        "seller_notes": notes,
        "instruction": "Return a schema.org Product JSON with name, brand, color, material, description, offers.price and offers.priceCurrency.",
    });

    let messages = vec![
        LlmMessage::system(SYSTEM_PROMPT),
        LlmMessage::user(payload.to_string()),
    ];

    let response = llm
        .chat(&messages)
        .await
        .map_err(|err| IngestError::Llm(err.to_string()))?;

    let cleaned = strip_markdown_fence(&response.text);
    let mut value: Value =
        serde_json::from_str(&cleaned).map_err(|err| IngestError::Parse(err.to_string()))?;
    normalize_product_value(&mut value, sku, images);
    serde_json::from_value::<Product>(value).map_err(|err| IngestError::Parse(err.to_string()))
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

/// Fills the fields `Product` requires so a sparse model answer still parses.
fn normalize_product_value(value: &mut Value, sku: &str, images: &[String]) {
    if !value.is_object() {
        *value = json!({});
    }
    let Some(obj) = value.as_object_mut() else {
        return;
    };

    let blank_name = obj
        .get("name")
        .and_then(Value::as_str)
        .map(|s| s.trim().is_empty())
        .unwrap_or(true);
    if blank_name {
        obj.insert("name".into(), json!("Untitled Product"));
    }

    if obj.get("sku").is_none() {
        obj.insert("sku".into(), json!(sku));
    }

    // Models sometimes answer with a bare brand string.
    if let Some(Value::String(name)) = obj.get("brand") {
        let name = name.clone();
        obj.insert("brand".into(), json!({ "name": name }));
    }

    let image_field = obj.entry("image").or_insert(Value::Null);
    let empty = match &*image_field {
        Value::String(s) => s.trim().is_empty(),
        Value::Array(arr) => arr.is_empty(),
        Value::Null => true,
        _ => false,
    };
    if empty {
        *image_field = json!(images.iter().take(MAX_IMAGES).collect::<Vec<_>>());
    }

    let offers = obj.entry("offers").or_insert_with(|| json!({}));
    if !offers.is_object() {
        *offers = json!({});
    }
    if let Some(offers_obj) = offers.as_object_mut() {
        match offers_obj.get("price") {
            Some(Value::String(text)) => {
                let parsed = text.trim().trim_start_matches('$').parse::<f64>().ok();
                offers_obj.insert("price".into(), json!(parsed.unwrap_or(49.99)));
            }
            Some(Value::Number(_)) => {}
            _ => {
                offers_obj.insert("price".into(), json!(49.99));
            }
        }
        if offers_obj.get("priceCurrency").is_none() {
            offers_obj.insert("priceCurrency".into(), json!("USD"));
        }
        if offers_obj.get("itemCondition").is_none() {
            offers_obj.insert("itemCondition".into(), json!(USED_CONDITION));
        }
    }
}

/// Placeholder product for items nothing has looked at yet. The title ends in
/// " listing" so price research treats it as a placeholder.
pub fn fallback_product(sku: &str, images: &[String]) -> Product {
    let primary = images.first().cloned().unwrap_or_default();
    Product {
        name: format!("{sku} listing"),
        image: if images.len() == 1 {
            ImageField::Single(primary)
        } else {
            ImageField::Multiple(images.to_vec())
        },
        offers: Offer {
            price: Some(99.0),
            priceCurrency: Some("USD".into()),
            itemCondition: Some(USED_CONDITION.into()),
            priceSpecification: None,
        },
        description: Some("Automated placeholder description".into()),
        brand: Some(Brand {
            name: Some("Hermes Labs".into()),
        }),
        color: Some("Black".into()),
        material: Some("Mixed materials".into()),
        size: None,
        sku: Some(sku.to_string()),
        mpn: None,
        height: None,
        width: None,
        depth: None,
        weight: Some(QuantitativeValue {
            unitCode: Some("LBR".into()),
            unitText: Some("Pounds".into()),
            value: Some(1.0),
        }),
    }
}

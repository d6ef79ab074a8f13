use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type ItemId = Uuid;

/// Accumulated listing data for one work item.
///
/// Starts as the raw submission (image URLs, SKU, any user-entered fields)
/// and is enriched by each stage. Merging overwrites keys it carries but
/// never removes existing ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn merge(&mut self, fields: Map<String, Value>) {
        for (key, value) in fields {
            self.0.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Price as a number; accepts both `12.5` and `"12.50"`.
    pub fn price(&self) -> Option<f64> {
        match self.0.get("price")? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn images(&self) -> Vec<String> {
        match self.0.get("images") {
            Some(Value::String(single)) => single
                .split(['\n', ',', ';', '|'])
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect(),
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub payload: Payload,
}

impl WorkItem {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analysis,
    Pricing,
    Persistence,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Analysis, Stage::Pricing, Stage::Persistence];

    pub fn index(self) -> usize {
        match self {
            Stage::Analysis => 0,
            Stage::Pricing => 1,
            Stage::Persistence => 2,
        }
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Analysis => Some(Stage::Pricing),
            Stage::Pricing => Some(Stage::Persistence),
            Stage::Persistence => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Analysis => "analysis",
            Stage::Pricing => "pricing",
            Stage::Persistence => "persistence",
        }
    }

    /// Progress shown while this stage owns the item.
    pub fn progress(self) -> u8 {
        match self {
            Stage::Analysis => 25,
            Stage::Pricing => 50,
            Stage::Persistence => 75,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Skipped,
    Error,
}

impl StageStatus {
    /// Forward-only: pending -> processing -> {completed, skipped, error}.
    pub fn can_transition_to(self, next: StageStatus) -> bool {
        matches!(
            (self, next),
            (StageStatus::Pending, StageStatus::Processing)
                | (StageStatus::Processing, StageStatus::Completed)
                | (StageStatus::Processing, StageStatus::Skipped)
                | (StageStatus::Processing, StageStatus::Error)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageStatuses {
    #[serde(rename = "stage1")]
    pub analysis: StageStatus,
    #[serde(rename = "stage2")]
    pub pricing: StageStatus,
    #[serde(rename = "stage3")]
    pub persistence: StageStatus,
}

impl StageStatuses {
    pub fn get(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::Analysis => self.analysis,
            Stage::Pricing => self.pricing,
            Stage::Persistence => self.persistence,
        }
    }

    pub fn set(&mut self, stage: Stage, status: StageStatus) {
        match stage {
            Stage::Analysis => self.analysis = status,
            Stage::Pricing => self.pricing = status,
            Stage::Persistence => self.persistence = status,
        }
    }
}

/// Which stage currently owns an item, or its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum OverallStage {
    Queued(Stage),
    Processing(Stage),
    Done,
    Error,
}

impl OverallStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, OverallStage::Done | OverallStage::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub item_id: ItemId,
    pub stage: OverallStage,
    pub stage_statuses: StageStatuses,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub payload: Payload,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn submitted(item: &WorkItem) -> Self {
        Self {
            item_id: item.id,
            stage: OverallStage::Queued(Stage::Analysis),
            stage_statuses: StageStatuses::default(),
            progress: 0,
            last_error: None,
            payload: item.payload.clone(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmittedItem {
    #[serde(default)]
    pub id: Option<ItemId>,
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub items: Vec<SubmittedItem>,
    #[serde(default)]
    pub config: Option<crate::cascade::config::CascadeOverrides>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCreated {
    pub batch_id: Uuid,
    pub item_ids: Vec<ItemId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchView {
    pub batch_id: Uuid,
    pub running: bool,
    pub cancelled: bool,
    pub items: Vec<ProgressRecord>,
}

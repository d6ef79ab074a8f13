use crate::models::Stage;
use serde::{Deserialize, Serialize};
use std::{env, path::Path, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {message}")]
    Read { path: String, message: String },
    #[error("invalid config file {path}: {message}")]
    Parse { path: String, message: String },
}

/// What a stage does with a collaborator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The item stops here with a terminal error.
    Terminal,
    /// The failure is downgraded to a skip and the item moves on unchanged.
    SkipStage,
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::Terminal => "terminal",
            FailurePolicy::SkipStage => "skip_stage",
        }
    }
}

macro_rules! per_stage {
    ($(#[$meta:meta])* $name:ident, $ty:ty, [$s1:expr, $s2:expr, $s3:expr]) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct $name {
            pub stage1: $ty,
            pub stage2: $ty,
            pub stage3: $ty,
        }

        impl $name {
            pub fn get(&self, stage: Stage) -> $ty {
                match stage {
                    Stage::Analysis => self.stage1,
                    Stage::Pricing => self.stage2,
                    Stage::Persistence => self.stage3,
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    stage1: $s1,
                    stage2: $s2,
                    stage3: $s3,
                }
            }
        }
    };
}

per_stage!(
    /// Upstream stages get tighter ceilings than the storage write.
    ConcurrencyLimits,
    usize,
    [2, 3, 5]
);
per_stage!(StageTimeouts, u64, [60_000, 20_000, 15_000]);
per_stage!(
    FailurePolicies,
    FailurePolicy,
    [
        FailurePolicy::Terminal,
        FailurePolicy::SkipStage,
        FailurePolicy::Terminal
    ]
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub concurrency_limits: ConcurrencyLimits,
    pub timeouts_ms: StageTimeouts,
    pub failure_policies: FailurePolicies,
    pub wave_delay_ms: u64,
    pub stage2_enabled: bool,
    pub max_batch_items: usize,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            concurrency_limits: ConcurrencyLimits::default(),
            timeouts_ms: StageTimeouts::default(),
            failure_policies: FailurePolicies::default(),
            wave_delay_ms: 250,
            stage2_enabled: true,
            max_batch_items: 50,
        }
    }
}

/// Per-batch knobs accepted on submission.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CascadeOverrides {
    #[serde(default)]
    pub concurrency_limits: Option<PartialStages<usize>>,
    #[serde(default)]
    pub wave_delay_ms: Option<u64>,
    #[serde(default)]
    pub stage2_enabled: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PartialStages<T> {
    pub stage1: Option<T>,
    pub stage2: Option<T>,
    pub stage3: Option<T>,
}

impl CascadeConfig {
    /// Defaults, then `CASCADE_CONFIG_FILE` (YAML) when set, then env vars.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match env::var("CASCADE_CONFIG_FILE") {
            Ok(path) if !path.trim().is_empty() => Self::from_yaml_file(path.trim())?,
            _ => Self::default(),
        };
        Ok(base.with_env())
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::from_yaml_str(&raw).map_err(|message| ConfigError::Parse {
            path: path.display().to_string(),
            message,
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, String> {
        serde_yaml::from_str(raw).map_err(|err| err.to_string())
    }

    pub fn with_env(mut self) -> Self {
        if let Some(v) = env_usize("CASCADE_STAGE1_CONCURRENCY") {
            self.concurrency_limits.stage1 = v;
        }
        if let Some(v) = env_usize("CASCADE_STAGE2_CONCURRENCY") {
            self.concurrency_limits.stage2 = v;
        }
        if let Some(v) = env_usize("CASCADE_STAGE3_CONCURRENCY") {
            self.concurrency_limits.stage3 = v;
        }
        if let Some(v) = env_u64("CASCADE_STAGE1_TIMEOUT_MS") {
            self.timeouts_ms.stage1 = v;
        }
        if let Some(v) = env_u64("CASCADE_STAGE2_TIMEOUT_MS") {
            self.timeouts_ms.stage2 = v;
        }
        if let Some(v) = env_u64("CASCADE_STAGE3_TIMEOUT_MS") {
            self.timeouts_ms.stage3 = v;
        }
        if let Some(v) = env_u64("CASCADE_WAVE_DELAY_MS") {
            self.wave_delay_ms = v;
        }
        if let Some(v) = env_bool("CASCADE_PRICING_ENABLED") {
            self.stage2_enabled = v;
        }
        if let Some(v) = env_usize("MAX_BATCH_ITEMS") {
            self.max_batch_items = v;
        }
        self
    }

    pub fn apply(&self, overrides: &CascadeOverrides) -> Self {
        let mut next = self.clone();
        if let Some(limits) = overrides.concurrency_limits {
            next.concurrency_limits.stage1 = limits.stage1.unwrap_or(next.concurrency_limits.stage1);
            next.concurrency_limits.stage2 = limits.stage2.unwrap_or(next.concurrency_limits.stage2);
            next.concurrency_limits.stage3 = limits.stage3.unwrap_or(next.concurrency_limits.stage3);
        }
        if let Some(delay) = overrides.wave_delay_ms {
            next.wave_delay_ms = delay;
        }
        if let Some(enabled) = overrides.stage2_enabled {
            next.stage2_enabled = enabled;
        }
        next
    }

    pub fn validate(&self) -> Result<(), String> {
        for stage in Stage::ALL {
            if self.concurrency_limits.get(stage) == 0 {
                return Err(format!("concurrency limit for {stage} must be at least 1"));
            }
            if self.timeouts_ms.get(stage) == 0 {
                return Err(format!("timeout for {stage} must be positive"));
            }
            let required = FailurePolicies::default().get(stage);
            if self.failure_policies.get(stage) != required {
                return Err(format!(
                    "failure policy for {stage} must be {}",
                    required.as_str()
                ));
            }
        }
        if self.max_batch_items == 0 {
            return Err("max_batch_items must be at least 1".into());
        }
        Ok(())
    }

    pub fn concurrency(&self, stage: Stage) -> usize {
        self.concurrency_limits.get(stage)
    }

    pub fn timeout(&self, stage: Stage) -> Duration {
        Duration::from_millis(self.timeouts_ms.get(stage))
    }

    pub fn failure_policy(&self, stage: Stage) -> FailurePolicy {
        self.failure_policies.get(stage)
    }

    pub fn wave_delay(&self) -> Duration {
        Duration::from_millis(self.wave_delay_ms)
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.trim().parse::<usize>().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    let value = env::var(key).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

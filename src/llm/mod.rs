mod tensorzero;

pub use tensorzero::{LlmClient, LlmConfig, LlmMessage};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
}

fn default_max_new_tokens() -> usize {
    256
}

fn default_temperature() -> f64 {
    0.7
}

fn default_top_p() -> f64 {
    0.9
}

impl GenerationRequest {
    /// A request for `prompt` with the default sampling parameters.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub response: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub model_id: String,
    pub dtype: String,
    pub device: String,
    pub size_bytes: u64,
    pub adapter: AdapterStatus,
}

/// What happened to the optional low-rank adapter during startup.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdapterStatus {
    /// No adapter was configured.
    None,
    Loaded {
        path: PathBuf,
        merged_tensors: usize,
    },
    FallbackToBase {
        reason: String,
    },
}

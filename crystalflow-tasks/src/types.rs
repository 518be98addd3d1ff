//! Request payloads and the values passed between activities.
//!
//! Every activity takes one of these as input and returns a new value; the
//! workflow threads them from stage to stage and never mutates a request.

use crystalflow_core::ActivityError;
use serde::{Deserialize, Serialize};

/// Body of `POST /start-inference-task` and input of the `inference`
/// workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Checkpoint location, relative to the model root unless absolute.
    pub model_path: String,
    /// Where to fetch the checkpoint from when it is not present locally.
    #[serde(default)]
    pub model_url: Option<String>,
    /// File holding the prompt, read when `raw_input` is empty.
    #[serde(default)]
    pub input_file: Option<String>,
    #[serde(default)]
    pub raw_input: Option<String>,
    #[serde(flatten)]
    pub params: GenerationParams,
    /// Write each sample to `sample_<k>.cif` once generation succeeds.
    #[serde(default)]
    pub generate_cif: bool,
}

impl InferenceRequest {
    pub fn new(model_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            model_url: None,
            input_file: None,
            raw_input: None,
            params: GenerationParams::default(),
            generate_cif: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Float32,
    #[default]
    Bfloat16,
    Float16,
}

/// Sampling parameters for one inference run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub num_samples: u32,
    pub max_new_tokens: u32,
    pub temperature: f64,
    pub top_k: u32,
    pub seed: u64,
    /// `cpu`, `cuda` or `cuda:<index>`.
    pub device: String,
    pub dtype: Dtype,
    pub compile: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            num_samples: 2,
            max_new_tokens: 3000,
            temperature: 0.8,
            top_k: 10,
            seed: 1337,
            device: "cpu".to_string(),
            dtype: Dtype::default(),
            compile: false,
        }
    }
}

impl GenerationParams {
    /// Reject parameters no sampler can honour.
    pub fn validate(&self) -> Result<(), ActivityError> {
        if self.num_samples == 0 {
            return Err(ActivityError::Validation(
                "num_samples must be at least 1".into(),
            ));
        }
        if self.max_new_tokens == 0 {
            return Err(ActivityError::Validation(
                "max_new_tokens must be at least 1".into(),
            ));
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(ActivityError::Validation(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if self.top_k == 0 {
            return Err(ActivityError::Validation("top_k must be at least 1".into()));
        }
        if !is_valid_device(&self.device) {
            return Err(ActivityError::Validation(format!(
                "unsupported device '{}'",
                self.device
            )));
        }
        Ok(())
    }
}

fn is_valid_device(device: &str) -> bool {
    match device {
        "cpu" | "cuda" => true,
        other => other
            .strip_prefix("cuda:")
            .is_some_and(|index| {
                !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit())
            }),
    }
}

/// Body of `POST /start-pubchem-task` and input of the `pubchem` workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRequest {
    pub molecule_name: String,
}

/// Input of `get_or_download_model`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchModel {
    pub model_path: String,
    pub model_url: Option<String>,
}

/// A checkpoint that is present on local storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Resolved location on disk.
    pub model_path: String,
    pub model_url: Option<String>,
    pub size_bytes: u64,
}

/// Input of `resolve_prompt_input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSource {
    pub raw_input: Option<String>,
    pub input_file: Option<String>,
}

/// Input of `run_inference`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceJob {
    pub model: ModelDescriptor,
    pub prompt: String,
    pub params: GenerationParams,
}

/// Input of `persist_results`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistRequest {
    /// Run id; names the output directory.
    pub run_id: String,
    pub samples: Vec<String>,
    pub generate_cif: bool,
}

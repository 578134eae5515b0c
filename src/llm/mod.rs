//! Generative model layer: engine seam, parameter heuristics, lifecycle.
//!
//! - **[`params`]**: filename → [`ModelConfig`] rule table
//! - **[`manager`]**: the single active model and its load/retry state machine
//! - **[`catalog`]**: the `*.gguf` models directory
//! - `llama` (feature `llama`): llama.cpp backend via `llama-cpp-2`
use std::path::Path;

use thiserror::Error;

pub mod catalog;
#[cfg(feature = "llama")]
pub mod llama;
pub mod manager;
pub mod params;

pub use catalog::{ModelCatalog, ModelInfo};
pub use manager::{LoadOutcome, ModelError, ModelManager, ModelState, ModelStatus};
pub use params::{ModelConfig, derive_config};

/// Errors raised by an inference backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

/// Fixed sampling settings for one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub max_tokens: usize,
    pub temperature: f32,
    pub repeat_penalty: f32,
    /// Prepend the prompt to the returned text.
    pub echo: bool,
}

impl SamplingParams {
    /// Settings used for grounded answers.
    #[must_use]
    pub fn answer(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            temperature: 0.7,
            repeat_penalty: 1.1,
            echo: false,
        }
    }
}

/// A loaded model ready for text completion.
///
/// Dropping the value releases the underlying weights.
pub trait LanguageModel: Send + Sync {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String, EngineError>;
}

/// Loads model artifacts. Calls are blocking and may take minutes.
pub trait InferenceEngine: Send + Sync {
    fn load(
        &self,
        path: &Path,
        config: &ModelConfig,
    ) -> Result<Box<dyn LanguageModel>, EngineError>;
}

/// Engine used when the crate is built without an inference backend.
///
/// Every load fails, so activation reports a `LoadFailure` and the assistant
/// keeps answering with retrieval-only results.
#[derive(Debug, Default)]
pub struct UnavailableEngine;

impl InferenceEngine for UnavailableEngine {
    fn load(
        &self,
        path: &Path,
        _config: &ModelConfig,
    ) -> Result<Box<dyn LanguageModel>, EngineError> {
        Err(EngineError::Load(format!(
            "cannot load {}: built without an inference backend (enable the `llama` feature)",
            path.display()
        )))
    }
}

/// The engine compiled into this build.
#[must_use]
pub fn default_engine() -> std::sync::Arc<dyn InferenceEngine> {
    #[cfg(feature = "llama")]
    {
        match llama::LlamaEngine::new() {
            Ok(engine) => return std::sync::Arc::new(engine),
            Err(e) => tracing::error!(error = %e, "llama.cpp backend unavailable"),
        }
    }
    std::sync::Arc::new(UnavailableEngine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_sampling_params() {
        let p = SamplingParams::answer(64);
        assert_eq!(p.max_tokens, 64);
        assert_eq!(p.temperature, 0.7);
        assert_eq!(p.repeat_penalty, 1.1);
        assert!(!p.echo);
    }

    #[test]
    fn test_unavailable_engine_rejects_loads() {
        let err = UnavailableEngine
            .load(Path::new("m.gguf"), &ModelConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Load(msg) if msg.contains("llama")));
    }
}

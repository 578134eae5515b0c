//! llama.cpp backend via `llama-cpp-2`.
//!
//! One [`LlamaBackend`] per process; each loaded [`LlamaModel`] creates a
//! fresh context per completion, sized by the [`ModelConfig`] it was loaded
//! with.
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use tracing::{debug, info};

use super::{EngineError, InferenceEngine, LanguageModel, ModelConfig, SamplingParams};

/// Tokens considered by the repetition penalty.
const PENALTY_LAST_N: i32 = 64;
/// Prompt batch size when the config does not set one.
const DEFAULT_BATCH: u32 = 512;

pub struct LlamaEngine {
    backend: Arc<LlamaBackend>,
}

impl LlamaEngine {
    /// Initialize the llama.cpp backend. Fails if it was already initialized.
    pub fn new() -> Result<Self, EngineError> {
        let mut backend = LlamaBackend::init()
            .map_err(|e| EngineError::Load(format!("failed to initialize llama backend: {e}")))?;
        backend.void_logs();
        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

fn context_params(config: &ModelConfig) -> LlamaContextParams {
    let batch = config.batch_size.unwrap_or(DEFAULT_BATCH);
    LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(config.context_window))
        .with_n_batch(batch)
        .with_n_threads(config.thread_count as i32)
        .with_n_threads_batch(config.thread_count as i32)
}

impl InferenceEngine for LlamaEngine {
    fn load(
        &self,
        path: &Path,
        config: &ModelConfig,
    ) -> Result<Box<dyn LanguageModel>, EngineError> {
        let model_params = LlamaModelParams::default().with_n_gpu_layers(config.gpu_layers);

        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| EngineError::Load(format!("{}: {e}", path.display())))?;

        // Allocate one context up front so an oversized window fails here,
        // where the manager can retry, rather than on the first question.
        model
            .new_context(&self.backend, context_params(config))
            .map_err(|e| EngineError::Load(format!("failed to create context: {e}")))?;

        info!(
            n_vocab = model.n_vocab(),
            n_params = model.n_params(),
            context_window = config.context_window,
            "GGUF model loaded"
        );

        Ok(Box::new(LlamaLoaded {
            backend: Arc::clone(&self.backend),
            model,
            config: *config,
        }))
    }
}

struct LlamaLoaded {
    backend: Arc<LlamaBackend>,
    model: LlamaModel,
    config: ModelConfig,
}

impl LanguageModel for LlamaLoaded {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String, EngineError> {
        let mut ctx = self
            .model
            .new_context(&self.backend, context_params(&self.config))
            .map_err(|e| EngineError::Inference(format!("failed to create context: {e}")))?;

        let tokens = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| EngineError::Inference(format!("tokenization failed: {e}")))?;

        let n_ctx = self.config.context_window as usize;
        if tokens.is_empty() {
            return Err(EngineError::Inference("prompt produced no tokens".to_string()));
        }
        if tokens.len() >= n_ctx {
            return Err(EngineError::Inference(format!(
                "prompt is {} tokens, context window is {n_ctx}",
                tokens.len()
            )));
        }

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        let last = tokens.len() - 1;
        for (i, &token) in tokens.iter().enumerate() {
            batch
                .add(token, i as i32, &[0], i == last)
                .map_err(|e| EngineError::Inference(format!("failed to add token to batch: {e}")))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Inference(format!("decode failed: {e}")))?;

        let mut sampler = LlamaSampler::chain_simple([
            LlamaSampler::penalties(PENALTY_LAST_N, params.repeat_penalty, 0.0, 0.0),
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(rand_seed()),
        ]);

        let budget = params.max_tokens.min(n_ctx - tokens.len());
        let mut generated: Vec<LlamaToken> = Vec::new();
        let mut pos = tokens.len() as i32;

        for _ in 0..budget {
            let token = sampler.sample(&ctx, -1);
            sampler.accept(token);

            if self.model.is_eog_token(token) {
                debug!("End of generation token reached");
                break;
            }
            generated.push(token);

            batch.clear();
            batch
                .add(token, pos, &[0], true)
                .map_err(|e| EngineError::Inference(format!("failed to add token: {e}")))?;
            ctx.decode(&mut batch)
                .map_err(|e| EngineError::Inference(format!("decode failed: {e}")))?;
            pos += 1;
        }

        let output = self
            .model
            .tokens_to_str(&generated, Special::Tokenize)
            .map_err(|e| EngineError::Inference(format!("token decoding failed: {e}")))?;

        debug!(
            generated_tokens = generated.len(),
            output_len = output.len(),
            "Generation complete"
        );

        if params.echo {
            return Ok(format!("{prompt}{output}"));
        }
        Ok(output)
    }
}

fn rand_seed() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
}

/// Text embedding: the `Embedder` trait and its implementations.
///
/// The vector index only sees `dyn Embedder`; the concrete encoder is picked
/// from `embedding.backend` at startup.
pub mod download;
pub mod hashing;
pub mod onnx;
pub mod tokenizer;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::info;

use crate::config::{EmbeddingBackend, EmbeddingConfig};

/// Errors that can occur during embedding operations.
#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("model load failed: {0}")]
    ModelLoadFailed(String),

    #[error("tokenizer error: {0}")]
    TokenizerError(String),
}

/// Trait for text embedding implementations.
///
/// All implementations must be `Send + Sync` to allow concurrent use
/// behind `Arc`. Output must be deterministic for a fixed model.
pub trait Embedder: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;

    /// Embed multiple text strings into vectors.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError>;

    /// Return the dimensionality of the embedding vectors.
    fn dimensions(&self) -> usize;
}

/// Build the encoder selected by the configuration.
///
/// For the ONNX backend the model files are downloaded first when
/// `auto_download` is set and any of them is missing.
pub fn from_config(cfg: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match cfg.backend {
        EmbeddingBackend::Hashing => {
            info!(dimensions = cfg.dimensions, "Using hashing embedder");
            Ok(Arc::new(hashing::HashingEmbedder::new(cfg.dimensions)))
        }
        EmbeddingBackend::Onnx => {
            let model_dir = Path::new(&cfg.model_dir);
            if cfg.auto_download && !download::all_files_present(model_dir) {
                download::download_model_files(model_dir)?;
            }
            let embedder = onnx::OnnxEmbedder::new(model_dir, cfg.dimensions)
                .context("failed to initialize ONNX embedder")?;
            Ok(Arc::new(embedder))
        }
    }
}

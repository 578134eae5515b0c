/// ONNX Runtime embedder using the `ort` crate.
///
/// Runs a sentence-transformers `all-MiniLM-L6-v2` export: BERT encoder,
/// mean pooling over the attention mask, then L2 normalization.
use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use super::tokenizer::BertTokenizer;
use super::{Embedder, EmbedderError};

/// ONNX-backed embedder implementing the `Embedder` trait.
pub struct OnnxEmbedder {
    session: Mutex<Session>,
    tokenizer: BertTokenizer,
    dimensions: usize,
}

impl OnnxEmbedder {
    /// Load `model.onnx` and `tokenizer.json` from `model_dir`.
    ///
    /// `dimensions` is the hidden size of the exported encoder (384 for MiniLM).
    pub fn new(model_dir: &Path, dimensions: usize) -> Result<Self, EmbedderError> {
        let model_path = model_dir.join("model.onnx");

        if !model_path.exists() {
            return Err(EmbedderError::ModelLoadFailed(format!(
                "model.onnx not found in {}",
                model_dir.display()
            )));
        }

        info!(model = %model_path.display(), "Initializing ONNX Runtime");

        let session = Session::builder()
            .map_err(|e| EmbedderError::ModelLoadFailed(format!("session builder error: {e}")))?
            .with_intra_threads(4)
            .map_err(|e| EmbedderError::ModelLoadFailed(format!("thread config error: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| EmbedderError::ModelLoadFailed(format!("model load error: {e}")))?;

        let tokenizer = BertTokenizer::from_model_dir(model_dir)
            .map_err(|e| EmbedderError::TokenizerError(e.to_string()))?;

        info!(
            vocab_size = tokenizer.vocab_size(),
            dimensions, "Sentence encoder ready"
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            dimensions,
        })
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let tokens = self
            .tokenizer
            .tokenize(text)
            .map_err(|e| EmbedderError::TokenizerError(format!("tokenization failed: {e}")))?;

        let seq_len = tokens.input_ids.len();

        // (shape, data) tuples avoid coupling to ort's ndarray version
        let input_ids_val = Tensor::from_array(([1usize, seq_len], tokens.input_ids))
            .map_err(|e| EmbedderError::InferenceFailed(format!("input_ids error: {e}")))?;
        let attention_mask_val =
            Tensor::from_array(([1usize, seq_len], tokens.attention_mask.clone())).map_err(
                |e| EmbedderError::InferenceFailed(format!("attention_mask error: {e}")),
            )?;
        let token_type_ids_val = Tensor::from_array(([1usize, seq_len], vec![0i64; seq_len]))
            .map_err(|e| EmbedderError::InferenceFailed(format!("token_type_ids error: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| EmbedderError::InferenceFailed(format!("lock poisoned: {e}")))?;
        let outputs = session
            .run(ort::inputs![
                "input_ids" => input_ids_val,
                "attention_mask" => attention_mask_val,
                "token_type_ids" => token_type_ids_val,
            ])
            .map_err(|e| EmbedderError::InferenceFailed(format!("inference failed: {e}")))?;

        // last_hidden_state: [1, seq_len, hidden]
        let (_shape, hidden_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("output extraction: {e}")))?;

        if hidden_data.len() != seq_len * self.dimensions {
            return Err(EmbedderError::InferenceFailed(format!(
                "unexpected output size {} for {seq_len} tokens x {} dims",
                hidden_data.len(),
                self.dimensions
            )));
        }

        let embedding = mean_pooling(
            hidden_data,
            &tokens.attention_mask,
            seq_len,
            self.dimensions,
        );
        debug!(seq_len, "Encoded text");

        Ok(l2_normalize(&embedding))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Mean pooling over hidden states weighted by attention mask.
///
/// `hidden_data` is a flat array with shape `[1, seq_len, hidden_size]`.
fn mean_pooling(
    hidden_data: &[f32],
    attention_mask: &[i64],
    seq_len: usize,
    hidden_size: usize,
) -> Vec<f32> {
    let mut result = vec![0.0f32; hidden_size];
    let mut mask_sum: f32 = 0.0;

    for t in 0..seq_len {
        let mask = attention_mask[t] as f32;
        mask_sum += mask;

        let row = &hidden_data[t * hidden_size..(t + 1) * hidden_size];
        for (acc, h) in result.iter_mut().zip(row) {
            *acc += h * mask;
        }
    }

    if mask_sum > 0.0 {
        for v in &mut result {
            *v /= mask_sum;
        }
    }

    result
}

fn l2_normalize(vec: &[f32]) -> Vec<f32> {
    let norm_sq: f32 = vec.iter().map(|v| v * v).sum();
    if norm_sq == 0.0 {
        return vec.to_vec();
    }

    let inv_norm = 1.0 / norm_sq.sqrt();
    vec.iter().map(|v| v * inv_norm).collect()
}

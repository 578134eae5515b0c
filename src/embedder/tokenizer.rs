/// BERT WordPiece tokenizer wrapper around HuggingFace `tokenizers`.
///
/// Produces input IDs and attention masks for the ONNX sentence encoder.
use std::path::Path;

use anyhow::Result;
use tokenizers::Tokenizer;

/// MiniLM was trained with sequences of up to 256 word pieces.
const MAX_SEQ_LENGTH: usize = 256;

/// Wrapper around the HuggingFace tokenizer for BERT-style models.
pub struct BertTokenizer {
    inner: Tokenizer,
}

/// Output of a tokenization operation.
#[derive(Debug, Clone)]
pub struct TokenizerOutput {
    /// Token IDs (input_ids for the model).
    pub input_ids: Vec<i64>,
    /// Attention mask (1 for real tokens, 0 for padding).
    pub attention_mask: Vec<i64>,
}

impl BertTokenizer {
    /// Load a tokenizer from a `tokenizer.json` file in the model directory.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let tokenizer_path = model_dir.join("tokenizer.json");

        anyhow::ensure!(
            tokenizer_path.exists(),
            "tokenizer.json not found in {}",
            model_dir.display()
        );

        let mut inner = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;

        inner
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_SEQ_LENGTH,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("failed to configure truncation: {e}"))?;

        // Single-sequence encoding: no padding needed
        inner.with_padding(None);

        Ok(Self { inner })
    }

    /// Tokenize a single text, returning input IDs and attention mask.
    pub fn tokenize(&self, text: &str) -> Result<TokenizerOutput> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("failed to encode text: {e}"))?;

        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| i64::from(id)).collect();
        let attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| i64::from(m))
            .collect();

        Ok(TokenizerOutput {
            input_ids,
            attention_mask,
        })
    }

    /// Get the vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(false)
    }
}

/// Lexical feature-hashing embedder.
///
/// Each lowercased alphanumeric token is hashed (FNV-1a) into one of
/// `dimensions` buckets and the bucket counts are L2-normalized. Texts that
/// share words land close together, which makes retrieval order predictable
/// without loading a neural model.
use super::{Embedder, EmbedderError};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// A deterministic bag-of-words embedder.
pub struct HashingEmbedder {
    pub dimensions: usize,
}

impl HashingEmbedder {
    /// Create a new `HashingEmbedder` with the given dimensionality.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { dimensions: 384 }
    }
}

fn fnv1a(token: &str) -> u64 {
    token.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        if self.dimensions == 0 {
            return Err(EmbedderError::InferenceFailed(
                "embedding dimensions must be positive".to_string(),
            ));
        }

        let mut embedding = vec![0.0f32; self.dimensions];
        for token in tokens(text) {
            let bucket = (fnv1a(&token) % self.dimensions as u64) as usize;
            embedding[bucket] += 1.0;
        }

        // L2 normalize; text without tokens stays the zero vector
        let norm_sq: f32 = embedding.iter().map(|v| v * v).sum();
        if norm_sq > 0.0 {
            let inv = 1.0 / norm_sq.sqrt();
            for v in &mut embedding {
                *v *= inv;
            }
        }

        Ok(embedding)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

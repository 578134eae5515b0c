//! In-memory flat L2 vector index over a document snapshot.
//!
//! A rebuild encodes the whole corpus into a new [`Snapshot`] and swaps it in
//! under a short write lock; searches clone the current `Arc<Snapshot>` and
//! never observe a half-built index.
use std::cmp::Ordering;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, info};

use crate::embedder::{Embedder, EmbedderError};
use crate::store::Document;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedderError),

    #[error("encoder returned {got} vectors for {expected} documents")]
    CountMismatch { expected: usize, got: usize },

    #[error("vector {position} has {got} dimensions, expected {expected}")]
    DimensionMismatch {
        position: usize,
        expected: usize,
        got: usize,
    },

    #[error("index lock poisoned")]
    Poisoned,
}

/// Documents and their vectors, joined by position.
#[derive(Default)]
struct Snapshot {
    documents: Vec<Document>,
    /// Row-major, `documents.len() * dimensions` floats.
    vectors: Vec<f32>,
    dimensions: usize,
}

impl Snapshot {
    fn new(documents: Vec<Document>, rows: Vec<Vec<f32>>, dimensions: usize) -> Result<Self, IndexError> {
        if rows.len() != documents.len() {
            return Err(IndexError::CountMismatch {
                expected: documents.len(),
                got: rows.len(),
            });
        }

        let mut vectors = Vec::with_capacity(rows.len() * dimensions);
        for (position, row) in rows.into_iter().enumerate() {
            if row.len() != dimensions {
                return Err(IndexError::DimensionMismatch {
                    position,
                    expected: dimensions,
                    got: row.len(),
                });
            }
            vectors.extend(row);
        }

        Ok(Self {
            documents,
            vectors,
            dimensions,
        })
    }

    fn row(&self, position: usize) -> &[f32] {
        &self.vectors[position * self.dimensions..(position + 1) * self.dimensions]
    }
}

/// A scored search hit.
#[derive(Debug, Clone)]
pub struct Hit {
    pub document: Document,
    /// Squared L2 distance to the query vector.
    pub distance: f32,
}

/// Flat (exhaustive) L2 index. Every `build` is a full rebuild.
pub struct VectorIndex {
    embedder: Arc<dyn Embedder>,
    snapshot: RwLock<Arc<Snapshot>>,
}

/// Squared Euclidean distance.
#[must_use]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

impl VectorIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// Replace the index contents with `documents`. Returns the document count.
    ///
    /// On error the previous snapshot stays in place.
    pub fn build(&self, documents: Vec<Document>) -> Result<usize, IndexError> {
        let texts: Vec<String> = documents.iter().map(Document::embedding_text).collect();
        let text_refs: Vec<&str> = texts.iter().map(String::as_str).collect();

        let rows = if text_refs.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed_batch(&text_refs)?
        };

        let snapshot = Snapshot::new(documents, rows, self.embedder.dimensions())?;
        let count = snapshot.documents.len();

        *self.snapshot.write().map_err(|_| IndexError::Poisoned)? = Arc::new(snapshot);

        info!(documents = count, "Vector index rebuilt");
        Ok(count)
    }

    /// The `k` nearest documents to `query`, nearest first.
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<Document>, IndexError> {
        Ok(self
            .search_scored(query, k)?
            .into_iter()
            .map(|hit| hit.document)
            .collect())
    }

    /// Like [`search`](Self::search) but keeps the distances.
    ///
    /// Equal distances keep insertion order.
    pub fn search_scored(&self, query: &str, k: usize) -> Result<Vec<Hit>, IndexError> {
        let snapshot = self.current()?;
        if snapshot.documents.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed(query)?;
        if query_vector.len() != snapshot.dimensions {
            return Err(IndexError::DimensionMismatch {
                position: 0,
                expected: snapshot.dimensions,
                got: query_vector.len(),
            });
        }

        let mut scored: Vec<(usize, f32)> = (0..snapshot.documents.len())
            .map(|pos| (pos, l2_squared(&query_vector, snapshot.row(pos))))
            .collect();
        // stable: ties stay in insertion order
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        scored.truncate(k);

        debug!(k, returned = scored.len(), "Index search");

        Ok(scored
            .into_iter()
            .map(|(pos, distance)| Hit {
                document: snapshot.documents[pos].clone(),
                distance,
            })
            .collect())
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.current().map(|s| s.documents.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current(&self) -> Result<Arc<Snapshot>, IndexError> {
        self.snapshot
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| IndexError::Poisoned)
    }
}

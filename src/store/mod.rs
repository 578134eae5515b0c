//! Document store: the corpus the assistant retrieves from.
//!
//! The index never owns documents; it takes read-only copies from a
//! [`DocumentStore`] on every rebuild.
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod notes;

pub use notes::NoteStore;

/// A retrievable document. Immutable once handed to the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    pub created_at: String,
}

impl Document {
    /// Text fed to the encoder for this document.
    #[must_use]
    pub fn embedding_text(&self) -> String {
        format!("{}\n{}", self.title, self.content)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0}")]
    Validation(String),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Read access to the full corpus.
pub trait DocumentStore: Send + Sync {
    fn list_all_documents(&self) -> Result<Vec<Document>, StoreError>;
}

/// A fixed in-memory corpus.
impl DocumentStore for Vec<Document> {
    fn list_all_documents(&self) -> Result<Vec<Document>, StoreError> {
        Ok(self.clone())
    }
}

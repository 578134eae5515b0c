//! Top-level error type for assistant operations.
//!
//! Only structural failures live here. Generation failures are folded into
//! the answer text by the pipeline and never reach this type.
use thiserror::Error;

use crate::index::IndexError;
use crate::llm::ModelError;
use crate::llm::catalog::CatalogError;
use crate::store::StoreError;

pub type Result<T, E = AssistantError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum AssistantError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("background task failed: {0}")]
    Worker(String),
}

impl AssistantError {
    /// HTTP-equivalent status for request-level reporting.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Catalog(CatalogError::InvalidExtension | CatalogError::InvalidName(_)) => 400,
            Self::Catalog(CatalogError::NotFound(_)) => 404,
            Self::Model(ModelError::InvalidPath(_)) => 404,
            Self::Model(ModelError::NoModelLoaded) => 409,
            Self::Store(StoreError::Validation(_)) => 422,
            Self::Catalog(CatalogError::Io(_))
            | Self::Model(_)
            | Self::Store(_)
            | Self::Index(_)
            | Self::Worker(_) => 500,
        }
    }
}

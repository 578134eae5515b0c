//! The assistant service: one explicit object owning the index, the model
//! manager and the models directory. Constructed once and shared by handle.
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::{Config, ReindexPolicy};
use crate::embedder::Embedder;
use crate::error::{AssistantError, Result};
use crate::index::VectorIndex;
use crate::llm::catalog::UploadReceipt;
use crate::llm::{InferenceEngine, ModelCatalog, ModelConfig, ModelInfo, ModelManager, ModelStatus};
use crate::rag::{Answer, AnswerPipeline, PromptBuilder};
use crate::store::DocumentStore;

/// Result of a successful activation.
#[derive(Debug, Clone, Serialize)]
pub struct Activation {
    pub name: String,
    pub config: ModelConfig,
}

pub struct Assistant {
    store: Arc<dyn DocumentStore>,
    index: Arc<VectorIndex>,
    models: Arc<ModelManager>,
    catalog: ModelCatalog,
    pipeline: AnswerPipeline,
    reindex_policy: ReindexPolicy,
    default_max_tokens: usize,
}

impl Assistant {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn Embedder>,
        engine: Arc<dyn InferenceEngine>,
        catalog: ModelCatalog,
        config: &Config,
    ) -> Self {
        let index = Arc::new(VectorIndex::new(embedder));
        let models = Arc::new(
            ModelManager::new(engine, config.llm.load_timeout())
                .with_release_before_load(config.llm.release_before_load),
        );
        let prompt =
            PromptBuilder::new().with_max_document_chars(config.retrieval.max_document_chars);
        let pipeline = AnswerPipeline::new(Arc::clone(&index), Arc::clone(&models), prompt);

        Self {
            store,
            index,
            models,
            catalog,
            pipeline,
            reindex_policy: config.retrieval.reindex,
            default_max_tokens: config.llm.default_max_tokens,
        }
    }

    pub fn models(&self) -> &ModelManager {
        &self.models
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// Rebuild the index from the full corpus. Returns the document count.
    pub async fn reindex(&self) -> Result<usize> {
        let store = Arc::clone(&self.store);
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let documents = store.list_all_documents()?;
            Ok(index.build(documents)?)
        })
        .await
        .map_err(|e| AssistantError::Worker(e.to_string()))?
    }

    /// Answer a question from the notes corpus.
    ///
    /// With the `every_query` policy the corpus is re-fetched and re-encoded
    /// first. `max_tokens` defaults to `llm.default_max_tokens`.
    pub async fn ask(&self, query: &str, max_tokens: Option<usize>) -> Result<Answer> {
        if self.reindex_policy == ReindexPolicy::EveryQuery {
            let count = self.reindex().await?;
            debug!(documents = count, "Reindexed before query");
        }

        let max_tokens = max_tokens.unwrap_or(self.default_max_tokens);
        Ok(self.pipeline.answer(query, max_tokens).await?)
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let active = self.models.active_path().await;
        Ok(self.catalog.list(active.as_deref())?)
    }

    /// Store an uploaded model. See [`crate::llm::catalog::resolve_upload_name`].
    pub async fn upload_model<R>(
        &self,
        reader: R,
        original_filename: String,
        desired_name: Option<String>,
    ) -> Result<UploadReceipt>
    where
        R: Read + Send + 'static,
    {
        let catalog = self.catalog.clone();
        tokio::task::spawn_blocking(move || {
            catalog.upload(reader, &original_filename, desired_name.as_deref())
        })
        .await
        .map_err(|e| AssistantError::Worker(e.to_string()))?
        .map_err(Into::into)
    }

    /// Where a streamed upload should be written before [`commit_upload`](Self::commit_upload).
    pub fn upload_staging_path(&self) -> PathBuf {
        self.catalog.staging_path()
    }

    /// Validate and move a fully written staging file into the models directory.
    pub async fn commit_upload(
        &self,
        staged: PathBuf,
        original_filename: String,
        desired_name: Option<String>,
    ) -> Result<UploadReceipt> {
        let catalog = self.catalog.clone();
        tokio::task::spawn_blocking(move || {
            catalog.commit(&staged, &original_filename, desired_name.as_deref())
        })
        .await
        .map_err(|e| AssistantError::Worker(e.to_string()))?
        .map_err(Into::into)
    }

    /// Load `name` from the models directory and make it active.
    pub async fn activate_model(&self, name: &str) -> Result<Activation> {
        let path = self.catalog.existing(name)?;
        let config = self.models.set_model_path(&path).await?;
        info!(name, "Model {name} activated successfully");
        Ok(Activation {
            name: name.to_string(),
            config,
        })
    }

    /// Delete a model file, unloading it first if it is the active one.
    pub async fn delete_model(&self, name: &str) -> Result<()> {
        let path = self.catalog.existing(name)?;
        if self.models.unload_if_active(&path).await {
            info!(name, "Deleted model was active; cleared");
        }
        self.catalog.remove(name)?;
        Ok(())
    }

    pub async fn model_status(&self) -> ModelStatus {
        self.models.status().await
    }
}

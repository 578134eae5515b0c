//! Generation pipeline: retrieve, build the prompt, generate.
//!
//! Generation failures never escape as errors. They come back as the answer
//! text so a degraded response still carries its sources.
pub mod prompt;

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::index::{IndexError, VectorIndex};
use crate::llm::{ModelError, ModelManager, SamplingParams};
use crate::store::Document;

pub use prompt::PromptBuilder;

/// Documents given to the model as context.
pub const CONTEXT_TOP_K: usize = 3;
/// Documents returned as sources when no model is loaded.
pub const FALLBACK_TOP_K: usize = 5;

pub const NO_MODEL_ANSWER: &str = "No LLM model is currently loaded. Please upload a model first.";

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<Document>,
}

/// Retrieval plus generation over a shared index and model manager.
pub struct AnswerPipeline {
    index: Arc<VectorIndex>,
    models: Arc<ModelManager>,
    prompt: PromptBuilder,
}

impl AnswerPipeline {
    pub fn new(index: Arc<VectorIndex>, models: Arc<ModelManager>, prompt: PromptBuilder) -> Self {
        Self {
            index,
            models,
            prompt,
        }
    }

    /// Answer `query` from the current index.
    ///
    /// Only retrieval errors (a failing encoder) are returned as `Err`.
    pub async fn answer(&self, query: &str, max_tokens: usize) -> Result<Answer, IndexError> {
        if !self.models.is_loaded() {
            return self.retrieval_only(query);
        }

        let sources = self.index.search(query, CONTEXT_TOP_K)?;
        let prompt = self.prompt.build(&sources, query);
        info!(
            sources = sources.len(),
            prompt_len = prompt.len(),
            max_tokens,
            "Generating answer"
        );

        let answer = match self
            .models
            .generate(prompt, SamplingParams::answer(max_tokens))
            .await
        {
            Ok(text) => text,
            // unloaded between the check and the call
            Err(ModelError::NoModelLoaded) => return self.retrieval_only(query),
            Err(e) => {
                warn!(error = %e, "Generation failed");
                let detail = match e {
                    ModelError::Generation(msg) => msg,
                    other => other.to_string(),
                };
                format!("Error generating response: {detail}")
            }
        };

        Ok(Answer { answer, sources })
    }

    fn retrieval_only(&self, query: &str) -> Result<Answer, IndexError> {
        let sources = self.index.search(query, FALLBACK_TOP_K)?;
        Ok(Answer {
            answer: NO_MODEL_ANSWER.to_string(),
            sources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::hashing::HashingEmbedder;
    use crate::llm::{EngineError, InferenceEngine, LanguageModel, ModelConfig};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records the prompt it was given and replies with a fixed result.
    struct RecordingModel {
        reply: Result<String, EngineError>,
        seen: Arc<Mutex<Vec<(String, SamplingParams)>>>,
    }

    impl LanguageModel for RecordingModel {
        fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String, EngineError> {
            self.seen
                .lock()
                .unwrap()
                .push((prompt.to_string(), params.clone()));
            self.reply.clone()
        }
    }

    struct RecordingEngine {
        reply: Result<String, EngineError>,
        seen: Arc<Mutex<Vec<(String, SamplingParams)>>>,
    }

    impl InferenceEngine for RecordingEngine {
        fn load(
            &self,
            _path: &Path,
            _config: &ModelConfig,
        ) -> Result<Box<dyn LanguageModel>, EngineError> {
            Ok(Box::new(RecordingModel {
                reply: self.reply.clone(),
                seen: Arc::clone(&self.seen),
            }))
        }
    }

    fn doc(id: &str, title: &str, content: &str) -> Document {
        Document {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            created_at: String::new(),
        }
    }

    /// "apples" ranks A, then C, then B by shared words; D to F share none.
    fn corpus() -> Vec<Document> {
        vec![
            doc("a", "Note A", "apples"),
            doc("b", "Note B", "apples oranges pears plums figs"),
            doc("c", "Note C", "apples and oranges"),
            doc("d", "Note D", "pears"),
            doc("e", "Note E", "plums"),
            doc("f", "Note F", "figs"),
        ]
    }

    struct Setup {
        pipeline: AnswerPipeline,
        models: Arc<ModelManager>,
        seen: Arc<Mutex<Vec<(String, SamplingParams)>>>,
        _dir: tempfile::TempDir,
        model_path: std::path::PathBuf,
    }

    fn setup(reply: Result<String, EngineError>) -> Setup {
        let index = Arc::new(VectorIndex::new(Arc::new(HashingEmbedder::default())));
        index.build(corpus()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let engine = RecordingEngine {
            reply,
            seen: Arc::clone(&seen),
        };
        let models = Arc::new(ModelManager::new(Arc::new(engine), Duration::from_secs(5)));

        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("model.gguf");
        std::fs::write(&model_path, b"GGUF").unwrap();

        Setup {
            pipeline: AnswerPipeline::new(index, Arc::clone(&models), PromptBuilder::new()),
            models,
            seen,
            _dir: dir,
            model_path,
        }
    }

    #[tokio::test]
    async fn test_sentinel_with_five_sources_without_model() {
        let s = setup(Ok("unused".into()));
        let answer = s.pipeline.answer("apples", 100).await.unwrap();

        assert_eq!(answer.answer, NO_MODEL_ANSWER);
        assert_eq!(answer.sources.len(), FALLBACK_TOP_K);
        assert_eq!(answer.sources[0].id, "a");
        assert!(s.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generates_from_top_three() {
        let s = setup(Ok("Apples are in notes A and C.".into()));
        s.models.set_model_path(&s.model_path).await.unwrap();

        let answer = s.pipeline.answer("apples", 128).await.unwrap();
        assert_eq!(answer.answer, "Apples are in notes A and C.");
        let ids: Vec<&str> = answer.sources.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);

        let seen = s.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (prompt, params) = &seen[0];
        assert_eq!(*params, SamplingParams::answer(128));
        assert!(prompt.contains("Document 3:\nTitle: Note B\n"));
        assert!(!prompt.contains("Document 4:"));
        assert!(prompt.ends_with("Answer this question: apples<|end|>\n\n<|assistant|>Answer:"));
    }

    #[tokio::test]
    async fn test_generation_error_becomes_answer() {
        let s = setup(Err(EngineError::Inference("out of memory".into())));
        s.models.set_model_path(&s.model_path).await.unwrap();

        let answer = s.pipeline.answer("apples", 16).await.unwrap();
        assert_eq!(
            answer.answer,
            "Error generating response: inference failed: out of memory"
        );
        assert_eq!(answer.sources.len(), CONTEXT_TOP_K);
    }

    #[tokio::test]
    async fn test_empty_index_without_model() {
        let index = Arc::new(VectorIndex::new(Arc::new(HashingEmbedder::default())));
        let models = Arc::new(ModelManager::new(
            Arc::new(crate::llm::UnavailableEngine),
            Duration::from_secs(5),
        ));
        let pipeline = AnswerPipeline::new(index, models, PromptBuilder::new());

        let answer = pipeline.answer("anything", 16).await.unwrap();
        assert_eq!(answer.answer, NO_MODEL_ANSWER);
        assert!(answer.sources.is_empty());
    }
}

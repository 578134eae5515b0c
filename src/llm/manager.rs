//! Lifecycle of the single active generative model.
//!
//! ```text
//! Unloaded ──set_model_path──▶ Loading ──▶ Loaded
//!                                 │
//!                                 └──────▶ LoadFailed
//! ```
//!
//! Loads and generations are serialized through a single-permit gate that
//! travels with the blocking engine call on `tokio::task::spawn_blocking`,
//! so at most one engine call runs at a time even after a load times out.
//! A failed load never clears a working model unless `release_before_load`
//! asked for the old one to be dropped first.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, watch};
use tracing::{error, info, warn};

use super::params::{ModelConfig, derive_config_for_path};
use super::{EngineError, InferenceEngine, LanguageModel, SamplingParams};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Model path '{}' does not exist", .0.display())]
    InvalidPath(PathBuf),

    /// Both the derived and the minimal configuration were rejected.
    #[error("Error loading model: {first}; retry with minimal parameters failed: {retry}")]
    LoadFailure { first: String, retry: String },

    #[error("Model load timed out after {0:?}")]
    Timeout(Duration),

    #[error("no model is loaded")]
    NoModelLoaded,

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("model worker failed: {0}")]
    Worker(String),
}

/// Lifecycle state of the active-model slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
    LoadFailed,
}

/// Result of the two-step load sequence.
pub enum LoadOutcome {
    /// The model loaded; carries the config that worked.
    Success {
        model: Box<dyn LanguageModel>,
        config: ModelConfig,
    },
    /// Errors from each attempt, in order.
    Failure(Vec<EngineError>),
}

impl LoadOutcome {
    /// Try `derived`, then [`ModelConfig::minimal`] once.
    pub fn attempt(engine: &dyn InferenceEngine, path: &Path, derived: ModelConfig) -> Self {
        info!(path = %path.display(), config = ?derived, "Loading model");
        let first = match engine.load(path, &derived) {
            Ok(model) => {
                return Self::Success {
                    model,
                    config: derived,
                };
            }
            Err(e) => e,
        };

        warn!(error = %first, "Model load failed, retrying with minimal parameters");
        let minimal = ModelConfig::minimal();
        match engine.load(path, &minimal) {
            Ok(model) => {
                info!("Model loaded with minimal parameters");
                Self::Success {
                    model,
                    config: minimal,
                }
            }
            Err(retry) => {
                error!(error = %retry, "Model load with minimal parameters failed");
                Self::Failure(vec![first, retry])
            }
        }
    }
}

fn describe(error: Option<&EngineError>) -> String {
    error.map(ToString::to_string).unwrap_or_default()
}

/// Snapshot of the manager for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub state: ModelState,
    pub active_path: Option<PathBuf>,
    pub config: Option<ModelConfig>,
    pub last_error: Option<String>,
}

struct ActiveModel {
    path: PathBuf,
    config: ModelConfig,
    model: Arc<dyn LanguageModel>,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveModel>,
    last_error: Option<String>,
}

/// Owner of the single active model.
///
/// `gate` holds one permit. Every blocking engine call (load or
/// generation) moves the permit into its worker, so a load abandoned by a
/// timeout keeps the gate closed until the engine returns. `loads`
/// serializes whole `set_model_path` calls. `slot` is only held for short
/// reads and writes.
pub struct ModelManager {
    engine: Arc<dyn InferenceEngine>,
    slot: Mutex<Slot>,
    loads: Mutex<()>,
    gate: Arc<Semaphore>,
    state: watch::Sender<ModelState>,
    load_timeout: Duration,
    release_before_load: bool,
}

impl ModelManager {
    pub fn new(engine: Arc<dyn InferenceEngine>, load_timeout: Duration) -> Self {
        Self {
            engine,
            slot: Mutex::new(Slot::default()),
            loads: Mutex::new(()),
            gate: Arc::new(Semaphore::new(1)),
            state: watch::Sender::new(ModelState::Unloaded),
            load_timeout,
            release_before_load: false,
        }
    }

    /// Drop the active model before loading its replacement.
    #[must_use]
    pub fn with_release_before_load(mut self, release: bool) -> Self {
        self.release_before_load = release;
        self
    }

    /// Current lifecycle state. Does not wait for an in-flight load.
    pub fn state(&self) -> ModelState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ModelState> {
        self.state.subscribe()
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == ModelState::Loaded
    }

    pub async fn status(&self) -> ModelStatus {
        let slot = self.slot.lock().await;
        ModelStatus {
            state: self.state(),
            active_path: slot.active.as_ref().map(|a| a.path.clone()),
            config: slot.active.as_ref().map(|a| a.config),
            last_error: slot.last_error.clone(),
        }
    }

    /// Path of the active model, if any.
    pub async fn active_path(&self) -> Option<PathBuf> {
        self.slot.lock().await.active.as_ref().map(|a| a.path.clone())
    }

    async fn acquire_gate(&self) -> Result<OwnedSemaphorePermit, ModelError> {
        Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|e| ModelError::Worker(e.to_string()))
    }

    /// Load the model at `path` and make it the active one.
    ///
    /// Returns the config the model ended up loaded with, which is the
    /// minimal config when the derived one was rejected. Time spent waiting
    /// for an earlier, abandoned load counts against the timeout.
    pub async fn set_model_path(&self, path: impl AsRef<Path>) -> Result<ModelConfig, ModelError> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(ModelError::InvalidPath(path));
        }

        let _load = self.loads.lock().await;
        self.state.send_replace(ModelState::Loading);

        if self.release_before_load && self.slot.lock().await.active.take().is_some() {
            info!("Released previous model before load");
        }

        let derived = derive_config_for_path(&path);
        let engine = Arc::clone(&self.engine);
        let load_path = path.clone();
        let load = async {
            let permit = self.acquire_gate().await?;
            let worker = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                LoadOutcome::attempt(engine.as_ref(), &load_path, derived)
            });
            worker
                .await
                .map_err(|join| ModelError::Worker(join.to_string()))
        };

        let outcome = match tokio::time::timeout(self.load_timeout, load).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(path = %path.display(), timeout = ?self.load_timeout, "Model load timed out");
                Err(ModelError::Timeout(self.load_timeout))
            }
        };

        let result = match outcome {
            Ok(LoadOutcome::Success { model, config }) => Ok((model, config)),
            Ok(LoadOutcome::Failure(errors)) => Err(ModelError::LoadFailure {
                first: describe(errors.first()),
                retry: describe(errors.get(1)),
            }),
            Err(e) => Err(e),
        };

        let mut slot = self.slot.lock().await;
        match result {
            Ok((model, config)) => {
                // the previous model (if any) is dropped here, after its replacement loaded
                slot.active = Some(ActiveModel {
                    path: path.clone(),
                    config,
                    model: Arc::from(model),
                });
                slot.last_error = None;
                self.state.send_replace(ModelState::Loaded);
                info!(path = %path.display(), ?config, "Model activated");
                Ok(config)
            }
            Err(e) => {
                slot.last_error = Some(e.to_string());
                let next = if slot.active.is_some() {
                    // the previous model keeps serving
                    ModelState::Loaded
                } else {
                    ModelState::LoadFailed
                };
                self.state.send_replace(next);
                Err(e)
            }
        }
    }

    /// Release the active model. A no-op when nothing is loaded.
    pub async fn unload(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(active) = slot.active.take() {
            info!(path = %active.path.display(), "Model unloaded");
        }
        slot.last_error = None;
        self.state.send_replace(ModelState::Unloaded);
    }

    /// Unload only if `path` is the active model. Returns whether it was.
    pub async fn unload_if_active(&self, path: &Path) -> bool {
        let mut slot = self.slot.lock().await;
        let is_active = slot.active.as_ref().is_some_and(|a| a.path == path);
        if is_active {
            slot.active = None;
            slot.last_error = None;
            self.state.send_replace(ModelState::Unloaded);
            info!(path = %path.display(), "Active model cleared");
        }
        is_active
    }

    /// Run a completion on the active model.
    ///
    /// Completions wait on the gate, not on the slot, so status calls stay
    /// responsive while one runs. A model unloaded mid-completion is
    /// released once the completion returns.
    pub async fn generate(&self, prompt: String, params: SamplingParams) -> Result<String, ModelError> {
        let permit = self.acquire_gate().await?;
        let model = self
            .slot
            .lock()
            .await
            .active
            .as_ref()
            .map(|a| Arc::clone(&a.model))
            .ok_or(ModelError::NoModelLoaded)?;

        let worker = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            model.generate(&prompt, &params)
        });
        worker
            .await
            .map_err(|join| ModelError::Worker(join.to_string()))?
            .map_err(|e| ModelError::Generation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Engine whose behaviour is scripted per test.
    #[derive(Default)]
    struct ScriptedEngine {
        /// Reject configs whose context window exceeds this.
        max_context: Option<u32>,
        /// Reject every load.
        broken: bool,
        /// Sleep before answering a load.
        delay: Option<Duration>,
        /// Only the first n loads sleep; all of them when unset.
        delayed_loads: Option<usize>,
        loads: StdMutex<Vec<ModelConfig>>,
        live_models: Arc<AtomicUsize>,
        started: AtomicUsize,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    struct ScriptedModel {
        name: String,
        live: Arc<AtomicUsize>,
    }

    impl Drop for ScriptedModel {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl LanguageModel for ScriptedModel {
        fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String, EngineError> {
            if prompt.contains("slow") {
                std::thread::sleep(Duration::from_millis(300));
            }
            if prompt.contains("explode") {
                return Err(EngineError::Inference("kv cache exhausted".into()));
            }
            Ok(format!("{} says hi ({} tokens)", self.name, params.max_tokens))
        }
    }

    impl InferenceEngine for ScriptedEngine {
        fn load(
            &self,
            path: &Path,
            config: &ModelConfig,
        ) -> Result<Box<dyn LanguageModel>, EngineError> {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
            let result = self.load_inner(path, config);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    impl ScriptedEngine {
        fn load_inner(
            &self,
            path: &Path,
            config: &ModelConfig,
        ) -> Result<Box<dyn LanguageModel>, EngineError> {
            let nth = self.started.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                if self.delayed_loads.is_none_or(|n| nth < n) {
                    std::thread::sleep(delay);
                }
            }
            self.loads.lock().unwrap().push(*config);
            if self.broken {
                return Err(EngineError::Load("unsupported format".into()));
            }
            if self.max_context.is_some_and(|max| config.context_window > max) {
                return Err(EngineError::Load("insufficient memory".into()));
            }
            self.live_models.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedModel {
                name: path.file_name().unwrap().to_string_lossy().into_owned(),
                live: Arc::clone(&self.live_models),
            }))
        }
    }

    fn model_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"GGUF").unwrap();
        path
    }

    fn manager(engine: Arc<ScriptedEngine>) -> ModelManager {
        ModelManager::new(engine, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_missing_path_is_invalid() {
        let mgr = manager(Arc::new(ScriptedEngine::default()));
        let err = mgr.set_model_path("/nonexistent/model.gguf").await.unwrap_err();
        assert!(matches!(err, ModelError::InvalidPath(_)));
        assert_eq!(mgr.state(), ModelState::Unloaded);
        assert!(mgr.active_path().await.is_none());
    }

    #[tokio::test]
    async fn test_load_with_derived_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "mistral-7b.Q4_K_M.gguf");
        let engine = Arc::new(ScriptedEngine::default());
        let mgr = manager(Arc::clone(&engine));

        let config = mgr.set_model_path(&path).await.unwrap();
        assert_eq!(config.context_window, 4096);
        assert_eq!(config.batch_size, Some(512));
        assert_eq!(mgr.state(), ModelState::Loaded);
        assert_eq!(mgr.active_path().await, Some(path));
        assert_eq!(engine.loads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_with_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "llama-3-8b.gguf");
        let engine = Arc::new(ScriptedEngine {
            max_context: Some(2048),
            ..Default::default()
        });
        let mgr = manager(Arc::clone(&engine));

        let config = mgr.set_model_path(&path).await.unwrap();
        assert_eq!(config, ModelConfig::minimal());
        assert_eq!(mgr.state(), ModelState::Loaded);

        let loads = engine.loads.lock().unwrap().clone();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].context_window, 4096);
        assert_eq!(loads[1], ModelConfig::minimal());

        let status = mgr.status().await;
        assert_eq!(status.config, Some(ModelConfig::minimal()));
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_retry_exactly_once_then_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "broken.gguf");
        let engine = Arc::new(ScriptedEngine {
            broken: true,
            ..Default::default()
        });
        let mgr = manager(Arc::clone(&engine));

        let err = mgr.set_model_path(&path).await.unwrap_err();
        match &err {
            ModelError::LoadFailure { first, retry } => {
                assert!(first.contains("unsupported format"));
                assert!(retry.contains("unsupported format"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().starts_with("Error loading model:"));
        assert_eq!(engine.loads.lock().unwrap().len(), 2);
        assert_eq!(mgr.state(), ModelState::LoadFailed);
        assert!(mgr.status().await.last_error.is_some());
    }

    #[tokio::test]
    async fn test_invalid_path_keeps_working_model() {
        let dir = tempfile::tempdir().unwrap();
        let good = model_file(&dir, "phi-2.gguf");
        let mgr = manager(Arc::new(ScriptedEngine::default()));
        mgr.set_model_path(&good).await.unwrap();

        let missing = dir.path().join("gone.gguf");
        assert!(matches!(
            mgr.set_model_path(&missing).await,
            Err(ModelError::InvalidPath(_))
        ));
        assert_eq!(mgr.active_path().await, Some(good));
        assert_eq!(mgr.state(), ModelState::Loaded);
    }

    #[tokio::test]
    async fn test_engine_failure_keeps_previous_model() {
        let dir = tempfile::tempdir().unwrap();
        let good = model_file(&dir, "phi-2.gguf");
        let bad = model_file(&dir, "other.gguf");

        let working = manager(Arc::new(ScriptedEngine::default()));
        working.set_model_path(&good).await.unwrap();

        // swap in an engine that rejects everything, keeping the loaded slot
        let broken = Arc::new(ScriptedEngine {
            broken: true,
            ..Default::default()
        });
        let mgr = ModelManager {
            engine: broken,
            ..working
        };
        assert!(matches!(
            mgr.set_model_path(&bad).await,
            Err(ModelError::LoadFailure { .. })
        ));
        assert_eq!(mgr.active_path().await, Some(good));
        assert_eq!(mgr.state(), ModelState::Loaded);
        assert!(mgr.status().await.last_error.is_some());
    }

    #[tokio::test]
    async fn test_release_before_load_clears_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let good = model_file(&dir, "phi-2.gguf");
        let bad = model_file(&dir, "other.gguf");

        let working = manager(Arc::new(ScriptedEngine::default())).with_release_before_load(true);
        working.set_model_path(&good).await.unwrap();

        let mgr = ModelManager {
            engine: Arc::new(ScriptedEngine {
                broken: true,
                ..Default::default()
            }),
            ..working
        };
        assert!(mgr.set_model_path(&bad).await.is_err());
        assert!(mgr.active_path().await.is_none());
        assert_eq!(mgr.state(), ModelState::LoadFailed);
    }

    #[tokio::test]
    async fn test_replacing_model_releases_old_one() {
        let dir = tempfile::tempdir().unwrap();
        let first = model_file(&dir, "a.gguf");
        let second = model_file(&dir, "b.gguf");
        let engine = Arc::new(ScriptedEngine::default());
        let mgr = manager(Arc::clone(&engine));

        mgr.set_model_path(&first).await.unwrap();
        mgr.set_model_path(&second).await.unwrap();
        assert_eq!(engine.live_models.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.active_path().await, Some(second));
    }

    #[tokio::test]
    async fn test_unload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "a.gguf");
        let engine = Arc::new(ScriptedEngine::default());
        let mgr = manager(Arc::clone(&engine));

        mgr.unload().await;
        assert_eq!(mgr.state(), ModelState::Unloaded);

        mgr.set_model_path(&path).await.unwrap();
        mgr.unload().await;
        mgr.unload().await;
        assert_eq!(mgr.state(), ModelState::Unloaded);
        assert_eq!(engine.live_models.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unload_if_active() {
        let dir = tempfile::tempdir().unwrap();
        let active = model_file(&dir, "a.gguf");
        let other = model_file(&dir, "b.gguf");
        let mgr = manager(Arc::new(ScriptedEngine::default()));
        mgr.set_model_path(&active).await.unwrap();

        assert!(!mgr.unload_if_active(&other).await);
        assert!(mgr.is_loaded());
        assert!(mgr.unload_if_active(&active).await);
        assert!(!mgr.is_loaded());
    }

    #[tokio::test]
    async fn test_generate() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "a.gguf");
        let mgr = manager(Arc::new(ScriptedEngine::default()));

        assert_eq!(
            mgr.generate("hi".into(), SamplingParams::answer(8)).await,
            Err(ModelError::NoModelLoaded)
        );

        mgr.set_model_path(&path).await.unwrap();
        let text = mgr.generate("hi".into(), SamplingParams::answer(8)).await.unwrap();
        assert_eq!(text, "a.gguf says hi (8 tokens)");

        let err = mgr
            .generate("please explode".into(), SamplingParams::answer(8))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Generation(msg) if msg.contains("kv cache")));
    }

    #[tokio::test]
    async fn test_load_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "slow.gguf");
        let engine = Arc::new(ScriptedEngine {
            delay: Some(Duration::from_millis(300)),
            ..Default::default()
        });
        let mgr = ModelManager::new(engine, Duration::from_millis(20));

        let err = mgr.set_model_path(&path).await.unwrap_err();
        assert!(matches!(err, ModelError::Timeout(_)));
        assert_eq!(mgr.state(), ModelState::LoadFailed);
        assert!(mgr.active_path().await.is_none());
    }

    #[tokio::test]
    async fn test_timed_out_load_blocks_next_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "slow.gguf");
        let engine = Arc::new(ScriptedEngine {
            delay: Some(Duration::from_millis(300)),
            delayed_loads: Some(1),
            ..Default::default()
        });
        let mgr = ModelManager::new(engine.clone(), Duration::from_millis(50));

        for _ in 0..3 {
            let err = mgr.set_model_path(&path).await.unwrap_err();
            assert!(matches!(err, ModelError::Timeout(_)));
        }
        // the later calls timed out waiting for the abandoned worker
        assert_eq!(engine.started.load(Ordering::SeqCst), 1);
        assert_eq!(engine.peak_in_flight.load(Ordering::SeqCst), 1);

        // the abandoned worker finishes and its late model is dropped
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(engine.live_models.load(Ordering::SeqCst), 0);

        mgr.set_model_path(&path).await.unwrap();
        assert!(mgr.is_loaded());
        assert_eq!(engine.live_models.load(Ordering::SeqCst), 1);
        assert_eq!(engine.peak_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_status_during_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "a.gguf");
        let mgr = Arc::new(manager(Arc::new(ScriptedEngine::default())));
        mgr.set_model_path(&path).await.unwrap();

        let running = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                mgr.generate("slow question".into(), SamplingParams::answer(4))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = tokio::time::timeout(Duration::from_millis(100), mgr.status())
            .await
            .expect("status waited for the completion");
        assert_eq!(status.state, ModelState::Loaded);
        assert_eq!(status.active_path, Some(path));

        let text = running.await.unwrap().unwrap();
        assert_eq!(text, "a.gguf says hi (4 tokens)");
    }

    #[tokio::test]
    async fn test_unload_during_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "a.gguf");
        let engine = Arc::new(ScriptedEngine::default());
        let mgr = Arc::new(manager(Arc::clone(&engine)));
        mgr.set_model_path(&path).await.unwrap();

        let running = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                mgr.generate("slow question".into(), SamplingParams::answer(4))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        mgr.unload().await;
        assert_eq!(mgr.state(), ModelState::Unloaded);

        assert!(running.await.unwrap().is_ok());
        assert_eq!(engine.live_models.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_state_transitions_are_observable() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "a.gguf");
        let mgr = manager(Arc::new(ScriptedEngine::default()));
        let mut rx = mgr.subscribe();
        assert_eq!(*rx.borrow_and_update(), ModelState::Unloaded);

        mgr.set_model_path(&path).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ModelState::Loaded);
    }
}

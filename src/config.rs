/// Configuration module for memex.
///
/// Handles loading, validating, and providing default configuration values.
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ── Default value functions ──────────────────────────────────────────

fn default_db_path() -> String {
    "./memex.db".to_string()
}

fn default_models_dir() -> String {
    "./models".to_string()
}

fn default_true() -> bool {
    true
}

fn default_embedding_dir() -> String {
    "./embeddings/all-MiniLM-L6-v2".to_string()
}

fn default_dimensions() -> usize {
    384
}

fn default_load_timeout_secs() -> u64 {
    300
}

fn default_max_tokens() -> usize {
    512
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// SQLite file holding the notes corpus.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Directory scanned for `*.gguf` model artifacts.
    #[serde(default = "default_models_dir")]
    pub models_dir: String,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    #[default]
    Onnx,
    Hashing,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub backend: EmbeddingBackend,

    #[serde(default = "default_embedding_dir")]
    pub model_dir: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_true")]
    pub auto_download: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    /// Upper bound on a single activation, retry included.
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,

    /// Drop the active model before loading a new one. Lowers peak memory,
    /// but a failed load then leaves no model active.
    #[serde(default)]
    pub release_before_load: bool,

    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: usize,
}

/// When the index is rebuilt from the document store.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReindexPolicy {
    /// Re-fetch and re-encode the full corpus before every `ask`.
    #[default]
    EveryQuery,
    /// Only rebuild on an explicit `reindex()`.
    Manual,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub reindex: ReindexPolicy,

    /// Per-document content cap inside the prompt, in characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_document_chars: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            models_dir: default_models_dir(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            retrieval: RetrievalConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::default(),
            model_dir: default_embedding_dir(),
            dimensions: default_dimensions(),
            auto_download: default_true(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            load_timeout_secs: default_load_timeout_secs(),
            release_before_load: false,
            default_max_tokens: default_max_tokens(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl LlmConfig {
    #[must_use]
    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"config.json"`.
    /// If the file does not exist, returns a default config and, for the
    /// default path only, writes it out as a template.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            "config.json"
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            if path == "config.json" {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.embedding.dimensions > 0,
            "embedding.dimensions must be positive"
        );
        anyhow::ensure!(
            self.llm.load_timeout_secs > 0,
            "llm.load_timeout_secs must be positive"
        );
        anyhow::ensure!(
            self.llm.default_max_tokens > 0,
            "llm.default_max_tokens must be positive"
        );
        anyhow::ensure!(!self.models_dir.is_empty(), "models_dir must be set");
        if let Some(cap) = self.retrieval.max_document_chars {
            anyhow::ensure!(cap > 0, "retrieval.max_document_chars must be positive");
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

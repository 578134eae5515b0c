//! Inference parameters derived from a model's filename.
//!
//! The heuristic is an ordered rule table: the first family whose marker
//! occurs in the lowercased filename decides the context window, and the
//! first quantization marker decides the batch size. Nothing else about the
//! file is inspected.
use std::path::Path;

use serde::Serialize;

pub const DEFAULT_CONTEXT_WINDOW: u32 = 2048;
pub const DEFAULT_THREADS: u32 = 4;
pub const DEFAULT_GPU_LAYERS: u32 = 0;

/// Parameters handed to the inference engine at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelConfig {
    pub context_window: u32,
    pub thread_count: u32,
    pub gpu_layers: u32,
    pub batch_size: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            context_window: DEFAULT_CONTEXT_WINDOW,
            thread_count: DEFAULT_THREADS,
            gpu_layers: DEFAULT_GPU_LAYERS,
            batch_size: None,
        }
    }
}

impl ModelConfig {
    /// Fallback used when a load with the derived config fails: small
    /// context, single thread, CPU only.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            context_window: DEFAULT_CONTEXT_WINDOW,
            thread_count: 1,
            gpu_layers: 0,
            batch_size: None,
        }
    }
}

/// One model family. `variants` are checked in order; `fallback` applies
/// when none of them match.
struct FamilyRule {
    markers: &'static [&'static str],
    variants: &'static [(&'static str, u32)],
    fallback: Option<u32>,
}

const FAMILY_RULES: &[FamilyRule] = &[
    FamilyRule {
        markers: &["llama", "meta-llama"],
        variants: &[("3", 4096), ("2", 4096)],
        fallback: None,
    },
    FamilyRule {
        markers: &["mistral"],
        variants: &[],
        fallback: Some(4096),
    },
    FamilyRule {
        markers: &["phi"],
        variants: &[("mini", 4096)],
        fallback: Some(2048),
    },
    FamilyRule {
        markers: &["gemma"],
        variants: &[],
        fallback: Some(4096),
    },
];

/// 4-bit quantizations that benefit from a larger batch.
const BATCH_RULES: &[(&str, u32)] = &[("q4_0", 512), ("q4_k_m", 512)];

fn context_window_for(name: &str) -> Option<u32> {
    let family = FAMILY_RULES
        .iter()
        .find(|rule| rule.markers.iter().any(|m| name.contains(m)))?;

    family
        .variants
        .iter()
        .find(|(marker, _)| name.contains(marker))
        .map(|&(_, ctx)| ctx)
        .or(family.fallback)
}

fn batch_size_for(name: &str) -> Option<u32> {
    BATCH_RULES
        .iter()
        .find(|(marker, _)| name.contains(marker))
        .map(|&(_, batch)| batch)
}

/// Derive a [`ModelConfig`] from the artifact's filename. Pure.
#[must_use]
pub fn derive_config(filename: &str) -> ModelConfig {
    let name = filename.to_lowercase();
    let defaults = ModelConfig::default();

    ModelConfig {
        context_window: context_window_for(&name).unwrap_or(defaults.context_window),
        batch_size: batch_size_for(&name),
        ..defaults
    }
}

/// [`derive_config`] on the final path component.
#[must_use]
pub fn derive_config_for_path(path: &Path) -> ModelConfig {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    derive_config(&filename)
}

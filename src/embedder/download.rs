/// Sentence-encoder file download from HuggingFace.
///
/// Fetches the ONNX export of `all-MiniLM-L6-v2` and its tokenizer when they
/// are not present locally.
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

const HF_BASE: &str = "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main";

/// Local file name and path relative to `HF_BASE`.
const MODEL_FILES: &[(&str, &str)] = &[
    ("model.onnx", "onnx/model.onnx"),
    ("tokenizer.json", "tokenizer.json"),
    ("config.json", "config.json"),
    ("special_tokens_map.json", "special_tokens_map.json"),
    ("tokenizer_config.json", "tokenizer_config.json"),
];

/// Return the default encoder directory path.
#[must_use]
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("embeddings/all-MiniLM-L6-v2")
}

/// Check whether all required model files exist in `model_dir`.
#[must_use]
pub fn all_files_present(model_dir: &Path) -> bool {
    MODEL_FILES
        .iter()
        .all(|(name, _)| model_dir.join(name).exists())
}

/// Download any missing encoder files into `model_dir`.
pub fn download_model_files(model_dir: &Path) -> Result<()> {
    info!("Checking encoder files in {}", model_dir.display());

    fs::create_dir_all(model_dir)
        .with_context(|| format!("failed to create encoder directory: {}", model_dir.display()))?;

    if all_files_present(model_dir) {
        info!("All encoder files found, skipping download");
        return Ok(());
    }

    info!("Downloading sentence encoder from HuggingFace (one-time, ~90MB)");

    for &(filename, url_path) in MODEL_FILES {
        let dest = model_dir.join(filename);

        if dest.exists() {
            info!("File already exists: {filename}");
            continue;
        }

        let url = format!("{HF_BASE}/{url_path}");
        info!(file = filename, "Downloading");
        download_file(&dest, &url).with_context(|| format!("failed to download {filename}"))?;
    }

    info!("Encoder download complete");
    Ok(())
}

fn download_file(dest: &Path, url: &str) -> Result<()> {
    let resp =
        reqwest::blocking::get(url).with_context(|| format!("HTTP request failed: {url}"))?;

    if !resp.status().is_success() {
        anyhow::bail!("bad status: {} for {url}", resp.status());
    }

    let total = resp.content_length().unwrap_or(0);

    let pb = if total > 0 {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {bar:40.cyan/blue} {percent}% ({bytes}/{total_bytes}) {msg}")
                .context("invalid progress template")?
                .progress_chars("█▓░"),
        );
        pb
    } else {
        ProgressBar::new_spinner()
    };

    let bytes = resp.bytes().context("failed to read response body")?;

    // Write to a sibling temp file so an interrupted download is never mistaken for a complete one
    let partial = dest.with_extension("part");
    let mut file = fs::File::create(&partial)
        .with_context(|| format!("failed to create file: {}", partial.display()))?;
    file.write_all(&bytes).context("failed to write file")?;
    fs::rename(&partial, dest)
        .with_context(|| format!("failed to move {} into place", partial.display()))?;

    pb.set_position(bytes.len() as u64);
    pb.finish_and_clear();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_files_present_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!all_files_present(dir.path()));
    }

    #[test]
    fn test_all_files_present_complete() {
        let dir = tempfile::tempdir().unwrap();
        for &(name, _) in MODEL_FILES {
            fs::write(dir.path().join(name), "dummy").unwrap();
        }
        assert!(all_files_present(dir.path()));
    }

    #[test]
    fn test_all_files_present_partial() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("tokenizer.json"), "dummy").unwrap();
        assert!(!all_files_present(dir.path()));
    }

    #[test]
    fn test_default_model_dir() {
        let dir = default_model_dir();
        assert!(dir.ends_with("all-MiniLM-L6-v2"));
    }
}

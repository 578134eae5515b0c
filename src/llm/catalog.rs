//! The models directory: one `*.gguf` file per candidate model.
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const MODEL_EXTENSION: &str = ".gguf";

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Invalid model file. Only .gguf files are supported.")]
    InvalidExtension,

    #[error("Invalid model name: {0}")]
    InvalidName(String),

    #[error("Model {0} not found")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One entry of [`ModelCatalog::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub path: PathBuf,
    pub is_active: bool,
}

/// Result of a successful upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub name: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// File-level view of the models directory.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    dir: PathBuf,
}

/// Pick the stored name for an upload.
///
/// The *original* filename must carry the `.gguf` suffix (case-sensitive).
/// The stored name is the trimmed `desired_name`, or the original filename
/// when no name is given, with `.gguf` appended if missing.
pub fn resolve_upload_name(
    original_filename: &str,
    desired_name: Option<&str>,
) -> Result<String, CatalogError> {
    if !original_filename.ends_with(MODEL_EXTENSION) {
        return Err(CatalogError::InvalidExtension);
    }

    let mut name = desired_name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(original_filename)
        .to_string();
    if !name.ends_with(MODEL_EXTENSION) {
        name.push_str(MODEL_EXTENSION);
    }

    validate_name(&name)?;
    Ok(name)
}

/// Names must be a single path component inside the models directory.
fn validate_name(name: &str) -> Result<(), CatalogError> {
    let bad = name.is_empty()
        || name.contains(['/', '\\'])
        || name == "."
        || name == ".."
        || name.starts_with("..");
    if bad {
        return Err(CatalogError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl ModelCatalog {
    /// Use `dir` as the models directory, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path for `name`, which must be a plain file name.
    pub fn path_for(&self, name: &str) -> Result<PathBuf, CatalogError> {
        validate_name(name)?;
        Ok(self.dir.join(name))
    }

    /// Path for an existing model, or `NotFound`.
    pub fn existing(&self, name: &str) -> Result<PathBuf, CatalogError> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(CatalogError::NotFound(name.to_string()));
        }
        Ok(path)
    }

    /// All `*.gguf` files, sorted by name. `active` marks the loaded one.
    pub fn list(&self, active: Option<&Path>) -> Result<Vec<ModelInfo>, CatalogError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut models = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(MODEL_EXTENSION) {
                continue;
            }
            let is_active = active.is_some_and(|a| a == path);
            models.push(ModelInfo {
                name,
                path,
                is_active,
            });
        }

        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    /// A fresh temporary path inside the models directory for an upload in
    /// progress. It never matches the `.gguf` listing filter.
    pub fn staging_path(&self) -> PathBuf {
        self.dir.join(format!(".upload-{}.partial", Uuid::new_v4()))
    }

    /// Move a fully written staging file into place under its resolved name.
    ///
    /// The staging file is removed when the name is rejected.
    pub fn commit(
        &self,
        staged: &Path,
        original_filename: &str,
        desired_name: Option<&str>,
    ) -> Result<UploadReceipt, CatalogError> {
        let name = match resolve_upload_name(original_filename, desired_name) {
            Ok(name) => name,
            Err(e) => {
                let _ = fs::remove_file(staged);
                return Err(e);
            }
        };
        let path = self.dir.join(&name);
        let bytes = fs::metadata(staged)?.len();
        fs::rename(staged, &path)?;

        info!(name = %name, bytes, "Model uploaded");
        Ok(UploadReceipt { name, path, bytes })
    }

    /// Stream `reader` into the models directory.
    ///
    /// Data goes to a staging file first and is renamed into place once
    /// complete, so listings never show a truncated model.
    pub fn upload<R: Read>(
        &self,
        mut reader: R,
        original_filename: &str,
        desired_name: Option<&str>,
    ) -> Result<UploadReceipt, CatalogError> {
        // reject before copying anything
        resolve_upload_name(original_filename, desired_name)?;
        let staged = self.staging_path();

        let copied = fs::File::create(&staged).and_then(|mut file| {
            io::copy(&mut reader, &mut file)?;
            file.flush()
        });
        if let Err(e) = copied {
            let _ = fs::remove_file(&staged);
            return Err(e.into());
        }

        self.commit(&staged, original_filename, desired_name)
    }

    /// Remove a model file.
    pub fn remove(&self, name: &str) -> Result<PathBuf, CatalogError> {
        let path = self.existing(name)?;
        fs::remove_file(&path)?;
        info!(name = %name, "Model deleted");
        Ok(path)
    }
}

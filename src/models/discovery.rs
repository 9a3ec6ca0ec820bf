//! Model directory scanning.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::artifact::{confine, sha256_file};
use super::descriptor::{ModelDescriptor, ModelFormat};
use super::error::ModelError;
use super::manifest::ModelManifest;

const SIDECAR_SUFFIX: &str = ".manifest.json";
const DIR_SIDECAR: &str = "manifest.json";

/// Scans a models root for artifacts.
///
/// Each top-level file with a recognized extension, and each top-level
/// directory holding one, is one artifact.
#[derive(Debug, Clone)]
pub struct ModelScanner {
    root: PathBuf,
    verify_hashes: bool,
}

impl ModelScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), verify_hashes: false }
    }

    /// Compute SHA-256 for every artifact and drop ones contradicting their sidecar.
    pub fn with_hashing(mut self, enabled: bool) -> Self {
        self.verify_hashes = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Blocking scan. Artifacts with unreadable sidecars are skipped with a
    /// warning rather than failing the whole pass.
    pub fn scan(&self) -> Result<Vec<ModelDescriptor>, ModelError> {
        if !self.root.is_dir() {
            return Err(ModelError::Discovery(format!(
                "models root {} is not a directory",
                self.root.display()
            )));
        }
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.root)
            .map_err(|e| ModelError::Discovery(format!("{}: {}", self.root.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for path in entries {
            let candidate = if path.is_dir() {
                self.describe_dir(&path)
            } else {
                self.describe_file(&path)
            };
            match candidate {
                Ok(Some(descriptor)) => {
                    if !seen.insert(descriptor.id.clone()) {
                        warn!(model_id = %descriptor.id, path = %path.display(), "Duplicate model id, skipping");
                        continue;
                    }
                    debug!(model_id = %descriptor.id, format = %descriptor.format, "Discovered model");
                    found.push(descriptor);
                }
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping model artifact"),
            }
        }
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    fn describe_file(&self, path: &Path) -> Result<Option<ModelDescriptor>, ModelError> {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        if name.ends_with(SIDECAR_SUFFIX) {
            return Ok(None);
        }
        let Some(format) = ModelFormat::from_path(path) else {
            return Ok(None);
        };
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name)
            .to_string();
        let sidecar = path.with_file_name(format!("{}{}", stem, SIDECAR_SUFFIX));
        self.build(stem, path, format, &sidecar).map(Some)
    }

    fn describe_dir(&self, dir: &Path) -> Result<Option<ModelDescriptor>, ModelError> {
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let mut weights: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| ModelError::Discovery(format!("{}: {}", dir.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && ModelFormat::from_path(p).is_some())
            .collect();
        weights.sort();
        let Some(file) = weights.into_iter().next() else {
            return Ok(None);
        };
        let format = ModelFormat::from_path(&file).unwrap_or(ModelFormat::Native);
        self.build(name.to_string(), &file, format, &dir.join(DIR_SIDECAR))
            .map(Some)
    }

    fn build(
        &self,
        id: String,
        path: &Path,
        format: ModelFormat,
        sidecar: &Path,
    ) -> Result<ModelDescriptor, ModelError> {
        let path = confine(&self.root, path).map_err(|e| ModelError::Discovery(e.to_string()))?;
        let size_bytes = fs::metadata(&path)
            .map_err(|e| ModelError::Discovery(format!("{}: {}", path.display(), e)))?
            .len();

        let mut descriptor = ModelDescriptor::from_path(id, path, format);
        descriptor.size_bytes = size_bytes;
        if sidecar.is_file() {
            descriptor = ModelManifest::from_file(sidecar)?.apply(descriptor);
        }

        if self.verify_hashes {
            let actual = sha256_file(&descriptor.path)
                .map_err(|e| ModelError::Discovery(e.to_string()))?;
            if let Some(declared) = &descriptor.sha256 {
                if *declared != actual {
                    return Err(ModelError::Discovery(format!(
                        "hash mismatch for {}: sidecar {}, file {}",
                        descriptor.id, declared, actual
                    )));
                }
            }
            descriptor.sha256 = Some(actual);
        }
        Ok(descriptor)
    }
}

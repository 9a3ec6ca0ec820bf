//! Sidecar metadata files.
//!
//! A model artifact may carry `<stem>.manifest.json` next to it, or
//! `manifest.json` inside a directory artifact. Every field is optional;
//! missing ones fall back to filename and extension defaults.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::descriptor::{ModelCapability, ModelDescriptor, ModelFormat};
use super::error::ModelError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelManifest {
    /// Overrides the id derived from the file name.
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub format: Option<ModelFormat>,
    #[serde(default)]
    pub capabilities: Vec<ModelCapability>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Expected SHA-256 of the weights file.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl ModelManifest {
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModelError::Discovery(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
            .map_err(|e| ModelError::Discovery(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(json: &str) -> Result<Self, String> {
        let manifest: Self =
            serde_json::from_str(json).map_err(|e| format!("invalid manifest JSON: {}", e))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(id) = &self.model_id {
            if id.trim().is_empty() {
                return Err("model_id cannot be empty".into());
            }
        }
        if let Some(hash) = &self.sha256 {
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err("sha256 must be 64 hex characters".into());
            }
        }
        Ok(())
    }

    /// Overlay the declared fields onto a default descriptor.
    pub fn apply(self, mut descriptor: ModelDescriptor) -> ModelDescriptor {
        if let Some(id) = self.model_id {
            descriptor.id = id;
        }
        if let Some(format) = self.format {
            descriptor.format = format;
            descriptor.capabilities = ModelCapability::defaults_for(format);
        }
        if !self.capabilities.is_empty() {
            descriptor.capabilities = self.capabilities;
        }
        descriptor.parameters.extend(self.parameters);
        if let Some(hash) = self.sha256 {
            descriptor.sha256 = Some(hash.to_ascii_lowercase());
        }
        descriptor
    }
}

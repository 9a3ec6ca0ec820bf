//! Model descriptors: what discovery knows about an artifact.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Runtime family that can execute an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    /// llama.cpp quantized format.
    Gguf,
    /// ONNX protobuf graph.
    Onnx,
    /// Framework-native weights (safetensors, PyTorch checkpoints).
    Native,
    /// Compiled into the runtime; has no artifact.
    Builtin,
}

impl ModelFormat {
    /// Map a file extension to a format. Case-insensitive.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "gguf" => Some(Self::Gguf),
            "onnx" => Some(Self::Onnx),
            "safetensors" | "bin" | "pt" | "pth" => Some(Self::Native),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gguf => "gguf",
            Self::Onnx => "onnx",
            Self::Native => "native",
            Self::Builtin => "builtin",
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a model can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCapability {
    TextGeneration,
    Chat,
    TextClassification,
    Embedding,
}

impl ModelCapability {
    /// Capabilities assumed when no sidecar declares any.
    pub fn defaults_for(format: ModelFormat) -> Vec<Self> {
        match format {
            ModelFormat::Gguf => vec![Self::TextGeneration, Self::Chat],
            ModelFormat::Onnx => vec![Self::TextClassification, Self::Embedding],
            ModelFormat::Native => vec![Self::TextGeneration],
            ModelFormat::Builtin => vec![Self::TextGeneration, Self::Chat],
        }
    }
}

/// Metadata for one discovered model artifact.
///
/// Rebuilt on every discovery pass and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    /// Weights file. For directory artifacts, the weights file inside it.
    pub path: PathBuf,
    pub format: ModelFormat,
    pub capabilities: Vec<ModelCapability>,
    pub size_bytes: u64,
    /// Free-form hints from the sidecar (context length, quantization...).
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Hex SHA-256 of the weights file, when hashing is enabled or declared.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl ModelDescriptor {
    /// Descriptor with defaults derived from the file name and extension.
    pub fn from_path(id: impl Into<String>, path: impl Into<PathBuf>, format: ModelFormat) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            format,
            capabilities: ModelCapability::defaults_for(format),
            size_bytes: 0,
            parameters: BTreeMap::new(),
            sha256: None,
        }
    }

    pub fn has_capability(&self, cap: ModelCapability) -> bool {
        self.capabilities.contains(&cap)
    }

    pub fn parameter_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(Value::as_u64)
    }
}

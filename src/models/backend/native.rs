//! Framework-native weights: safetensors and PyTorch checkpoints.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{load_mapped, LoadedModel, ModelBackend};
use crate::models::artifact::MappedArtifact;
use crate::models::descriptor::{ModelDescriptor, ModelFormat};
use crate::models::error::BackendError;

const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";
const PICKLE_PROTO: u8 = 0x80;
/// Upper bound on a safetensors JSON header.
const MAX_HEADER_LEN: u64 = 100 * 1024 * 1024;

pub struct NativeBackend;

fn validate_safetensors(artifact: &MappedArtifact) -> Result<String, BackendError> {
    let header_len = artifact
        .read_u64_le(0)
        .ok_or_else(|| BackendError::InvalidArtifact("safetensors header truncated".into()))?;
    if header_len == 0 || header_len > MAX_HEADER_LEN {
        return Err(BackendError::InvalidArtifact(format!(
            "implausible safetensors header length {}",
            header_len
        )));
    }
    let end = 8 + header_len as usize;
    let raw = artifact
        .as_bytes()
        .get(8..end)
        .ok_or_else(|| BackendError::InvalidArtifact("safetensors header exceeds file".into()))?;
    let header: Map<String, Value> = serde_json::from_slice(raw)
        .map_err(|e| BackendError::InvalidArtifact(format!("safetensors header: {}", e)))?;
    let tensors = header.keys().filter(|k| k.as_str() != "__metadata__").count();
    Ok(format!("safetensors, {} tensors", tensors))
}

fn validate_checkpoint(artifact: &MappedArtifact) -> Result<String, BackendError> {
    let bytes = artifact.as_bytes();
    if bytes.starts_with(ZIP_MAGIC) {
        Ok("torch zip checkpoint".into())
    } else if bytes.first() == Some(&PICKLE_PROTO) {
        Ok(format!("torch pickle protocol {}", bytes.get(1).copied().unwrap_or(0)))
    } else {
        Err(BackendError::InvalidArtifact(
            "not a zip or pickle checkpoint".into(),
        ))
    }
}

fn validate(artifact: &MappedArtifact) -> Result<String, BackendError> {
    let ext = artifact
        .path()
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("safetensors") => validate_safetensors(artifact),
        Some("bin" | "pt" | "pth") => validate_checkpoint(artifact),
        other => Err(BackendError::Unsupported(format!(
            "native weights with extension {:?}",
            other.unwrap_or("")
        ))),
    }
}

#[async_trait]
impl ModelBackend for NativeBackend {
    fn format(&self) -> ModelFormat {
        ModelFormat::Native
    }

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn LoadedModel>, BackendError> {
        load_mapped(descriptor, validate).await
    }
}

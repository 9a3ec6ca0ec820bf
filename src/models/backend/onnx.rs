//! ONNX artifacts.

use async_trait::async_trait;

use super::{load_mapped, LoadedModel, ModelBackend};
use crate::models::artifact::MappedArtifact;
use crate::models::descriptor::{ModelDescriptor, ModelFormat};
use crate::models::error::BackendError;

/// Field 1 (`ir_version`), wire type varint.
const IR_VERSION_TAG: u8 = 0x08;
const MAX_IR_VERSION: u64 = 64;

pub struct OnnxBackend;

fn read_varint(bytes: &[u8]) -> Option<u64> {
    let mut value = 0u64;
    for (i, byte) in bytes.iter().take(10).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

/// A serialized `ModelProto` starts with its `ir_version` field.
fn validate(artifact: &MappedArtifact) -> Result<String, BackendError> {
    let bytes = artifact.as_bytes();
    if bytes.first() != Some(&IR_VERSION_TAG) {
        return Err(BackendError::InvalidArtifact(
            "not an ONNX ModelProto (missing ir_version)".into(),
        ));
    }
    let version = read_varint(&bytes[1..])
        .ok_or_else(|| BackendError::InvalidArtifact("truncated ir_version".into()))?;
    if version == 0 || version > MAX_IR_VERSION {
        return Err(BackendError::Unsupported(format!("ONNX ir_version {}", version)));
    }
    Ok(format!("onnx ir_version {}", version))
}

#[async_trait]
impl ModelBackend for OnnxBackend {
    fn format(&self) -> ModelFormat {
        ModelFormat::Onnx
    }

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn LoadedModel>, BackendError> {
        load_mapped(descriptor, validate).await
    }
}

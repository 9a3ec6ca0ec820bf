//! GGUF (llama.cpp) artifacts.

use async_trait::async_trait;

use super::{load_mapped, LoadedModel, ModelBackend};
use crate::models::artifact::MappedArtifact;
use crate::models::descriptor::{ModelDescriptor, ModelFormat};
use crate::models::error::BackendError;

const MAGIC: &[u8; 4] = b"GGUF";
const HEADER_LEN: usize = 24;
const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 1..=3;

pub struct GgufBackend;

/// Check magic and version, and read the tensor and metadata counts.
fn validate(artifact: &MappedArtifact) -> Result<String, BackendError> {
    let bytes = artifact.as_bytes();
    if !bytes.starts_with(MAGIC) {
        return Err(BackendError::InvalidArtifact("missing GGUF magic".into()));
    }
    if bytes.len() < HEADER_LEN {
        return Err(BackendError::InvalidArtifact(format!(
            "GGUF header truncated at {} bytes",
            bytes.len()
        )));
    }
    let version = artifact.read_u32_le(4).unwrap_or(0);
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(BackendError::Unsupported(format!("GGUF version {}", version)));
    }
    let tensors = artifact.read_u64_le(8).unwrap_or(0);
    let metadata = artifact.read_u64_le(16).unwrap_or(0);
    Ok(format!("gguf v{}, {} tensors, {} kv", version, tensors, metadata))
}

#[async_trait]
impl ModelBackend for GgufBackend {
    fn format(&self) -> ModelFormat {
        ModelFormat::Gguf
    }

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn LoadedModel>, BackendError> {
        load_mapped(descriptor, validate).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backend::InferenceRequest;

    fn header(version: u32) -> Vec<u8> {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&version.to_le_bytes());
        bytes.extend_from_slice(&3u64.to_le_bytes());
        bytes.extend_from_slice(&5u64.to_le_bytes());
        bytes
    }

    fn mapped(dir: &tempfile::TempDir, bytes: &[u8]) -> MappedArtifact {
        let path = dir.path().join("m.gguf");
        std::fs::write(&path, bytes).unwrap();
        MappedArtifact::open(&path).unwrap()
    }

    #[test]
    fn test_valid_header() {
        let dir = tempfile::tempdir().unwrap();
        let summary = validate(&mapped(&dir, &header(3))).unwrap();
        assert_eq!(summary, "gguf v3, 3 tensors, 5 kv");
    }

    #[test]
    fn test_bad_magic_and_version() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            validate(&mapped(&dir, b"GGML0000000000000000000000")),
            Err(BackendError::InvalidArtifact(_))
        ));
        assert!(matches!(
            validate(&mapped(&dir, &header(9))),
            Err(BackendError::Unsupported(_))
        ));
        assert!(validate(&mapped(&dir, b"GGUF\x03")).is_err());
    }

    #[tokio::test]
    async fn test_load_and_infer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.gguf");
        std::fs::write(&path, header(2)).unwrap();
        let descriptor = ModelDescriptor::from_path("tiny", &path, ModelFormat::Gguf);

        let model = GgufBackend.load(&descriptor).await.unwrap();
        assert_eq!(model.memory_bytes(), HEADER_LEN);
        let text = model
            .infer(&InferenceRequest::new("User: hello there"))
            .await
            .unwrap();
        assert_eq!(text, "[tiny] hello there");

        model.unload().await.unwrap();
        assert_eq!(model.memory_bytes(), 0);
        assert!(model.infer(&InferenceRequest::new("x")).await.is_err());
    }
}

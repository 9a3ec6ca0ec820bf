//! Runtime dispatch over model formats.
//!
//! Each format has a [`ModelBackend`] that validates an artifact and returns a
//! [`LoadedModel`]. The manager picks the backend by descriptor format through
//! a [`BackendRegistry`].

mod builtin;
mod gguf;
mod native;
mod onnx;

pub use builtin::{builtin_descriptor, BuiltinBackend, BUILTIN_MODEL_ID};
pub(crate) use builtin::EchoModel;
pub use gguf::GgufBackend;
pub use native::NativeBackend;
pub use onnx::OnnxBackend;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::artifact::MappedArtifact;
use super::descriptor::{ModelDescriptor, ModelFormat};
use super::error::BackendError;

/// Default generation budget when a request does not set one.
pub const DEFAULT_MAX_TOKENS: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    /// Caller-side wait limit. Overrides the manager default.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), max_tokens: None, timeout: None }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub model_id: String,
    /// Version tag of the instance that served the call.
    pub version: u64,
    pub text: String,
    pub tokens: usize,
    pub latency_ms: u64,
}

/// A runnable model. Owned by one `ModelInstance`.
#[async_trait]
pub trait LoadedModel: Send + Sync + 'static {
    async fn infer(&self, request: &InferenceRequest) -> Result<String, BackendError>;

    /// Release native resources. Called once, after the instance drained.
    async fn unload(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn memory_bytes(&self) -> usize;
}

/// Loads artifacts of one format.
#[async_trait]
pub trait ModelBackend: Send + Sync + 'static {
    fn format(&self) -> ModelFormat;

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn LoadedModel>, BackendError>;
}

/// Format to backend table.
#[derive(Clone)]
pub struct BackendRegistry {
    backends: HashMap<ModelFormat, Arc<dyn ModelBackend>>,
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self { backends: HashMap::new() }
    }

    /// Registry with the GGUF, ONNX, native and built-in backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(BuiltinBackend));
        registry.register(Arc::new(GgufBackend));
        registry.register(Arc::new(OnnxBackend));
        registry.register(Arc::new(NativeBackend));
        registry
    }

    /// Install a backend, replacing any existing one for its format.
    pub fn register(&mut self, backend: Arc<dyn ModelBackend>) {
        self.backends.insert(backend.format(), backend);
    }

    pub fn get(&self, format: ModelFormat) -> Option<Arc<dyn ModelBackend>> {
        self.backends.get(&format).cloned()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Map and validate an artifact on the blocking pool.
///
/// `validate` inspects the header and returns a short summary for logs.
pub(crate) async fn load_mapped<F>(
    descriptor: &ModelDescriptor,
    validate: F,
) -> Result<Box<dyn LoadedModel>, BackendError>
where
    F: FnOnce(&MappedArtifact) -> Result<String, BackendError> + Send + 'static,
{
    let path = descriptor.path.clone();
    let expected = descriptor.sha256.clone();
    let model_id = descriptor.id.clone();
    let format = descriptor.format;

    let (artifact, summary) = tokio::task::spawn_blocking(move || {
        let artifact = MappedArtifact::open(&path)?;
        if let Some(expected) = expected {
            artifact.verify_sha256(&expected)?;
        }
        let summary = validate(&artifact)?;
        Ok::<_, BackendError>((artifact, summary))
    })
    .await
    .map_err(|e| BackendError::Execution(format!("validation task failed: {}", e)))??;

    tracing::debug!(model_id = %model_id, %format, summary = %summary, bytes = artifact.len(), "Artifact validated");
    Ok(Box::new(MappedModel {
        model_id,
        format,
        summary,
        artifact: Mutex::new(Some(artifact)),
    }))
}

/// Model backed by a validated memory map.
///
/// Produces deterministic text derived from the prompt; numerics are the
/// concern of the native runtime this stands in for.
struct MappedModel {
    model_id: String,
    format: ModelFormat,
    summary: String,
    artifact: Mutex<Option<MappedArtifact>>,
}

#[async_trait]
impl LoadedModel for MappedModel {
    async fn infer(&self, request: &InferenceRequest) -> Result<String, BackendError> {
        if self.artifact.lock().is_none() {
            return Err(BackendError::Execution(format!("{} is unloaded", self.model_id)));
        }
        let model_id = self.model_id.clone();
        let prompt = request.prompt.clone();
        let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        tokio::task::spawn_blocking(move || render_completion(&model_id, &prompt, max_tokens))
            .await
            .map_err(|e| BackendError::Execution(e.to_string()))
    }

    async fn unload(&self) -> Result<(), BackendError> {
        if let Some(artifact) = self.artifact.lock().take() {
            tracing::debug!(model_id = %self.model_id, format = %self.format, summary = %self.summary, path = %artifact.path().display(), "Artifact unmapped");
        }
        Ok(())
    }

    fn memory_bytes(&self) -> usize {
        self.artifact.lock().as_ref().map(MappedArtifact::len).unwrap_or(0)
    }
}

/// Deterministic completion: the model tag followed by the words of the
/// last prompt line that has content after its speaker tag, capped at
/// `max_tokens` words.
pub fn render_completion(model_id: &str, prompt: &str, max_tokens: usize) -> String {
    let last = prompt
        .lines()
        .rev()
        .map(strip_speaker)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let words: Vec<&str> = last.split_whitespace().take(max_tokens).collect();
    if words.is_empty() {
        format!("[{}]", model_id)
    } else {
        format!("[{}] {}", model_id, words.join(" "))
    }
}

fn strip_speaker(line: &str) -> &str {
    let line = line.trim();
    line.split_once(':')
        .filter(|(speaker, _)| !speaker.is_empty() && !speaker.contains(' '))
        .map(|(_, rest)| rest.trim())
        .unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_uses_last_line() {
        let prompt = "User: hi\nAI: [m] hi\nUser: what time is it\nAI:";
        assert_eq!(render_completion("m", prompt, 10), "[m] what time is it");
    }

    #[test]
    fn test_render_caps_tokens() {
        assert_eq!(render_completion("m", "one two three", 2), "[m] one two");
        assert_eq!(render_completion("m", "   ", 2), "[m]");
    }

    #[test]
    fn test_registry_defaults() {
        let registry = BackendRegistry::with_defaults();
        for format in [ModelFormat::Gguf, ModelFormat::Onnx, ModelFormat::Native, ModelFormat::Builtin] {
            assert_eq!(registry.get(format).unwrap().format(), format);
        }
        assert!(BackendRegistry::empty().get(ModelFormat::Gguf).is_none());
    }
}

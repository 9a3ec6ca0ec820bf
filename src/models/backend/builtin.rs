//! The built-in `default` model.
//!
//! Needs no artifact, so a fresh install can chat before any model is
//! dropped into the models directory. The manager installs it Ready at
//! construction and never unloads, swaps or removes it.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{render_completion, InferenceRequest, LoadedModel, ModelBackend, DEFAULT_MAX_TOKENS};
use crate::models::descriptor::{ModelDescriptor, ModelFormat};
use crate::models::error::BackendError;

/// Reserved id of the built-in model.
pub const BUILTIN_MODEL_ID: &str = "default";

pub fn builtin_descriptor() -> ModelDescriptor {
    ModelDescriptor::from_path(BUILTIN_MODEL_ID, PathBuf::new(), ModelFormat::Builtin)
}

/// Echoes the last prompt line through [`render_completion`].
pub(crate) struct EchoModel;

#[async_trait]
impl LoadedModel for EchoModel {
    async fn infer(&self, request: &InferenceRequest) -> Result<String, BackendError> {
        let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        Ok(render_completion(BUILTIN_MODEL_ID, &request.prompt, max_tokens))
    }

    fn memory_bytes(&self) -> usize {
        0
    }
}

pub struct BuiltinBackend;

#[async_trait]
impl ModelBackend for BuiltinBackend {
    fn format(&self) -> ModelFormat {
        ModelFormat::Builtin
    }

    async fn load(&self, _descriptor: &ModelDescriptor) -> Result<Box<dyn LoadedModel>, BackendError> {
        Ok(Box::new(EchoModel))
    }
}

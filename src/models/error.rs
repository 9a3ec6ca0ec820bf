//! Model manager error types.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by [`super::ModelManager`].
///
/// Cloneable so a single load outcome can be fanned out to every waiter.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Model not loaded: {0}")]
    NotLoaded(String),

    #[error("Failed to load model {model_id}: {reason}")]
    Load { model_id: String, reason: String },

    #[error("Inference failed on {model_id}: {reason}")]
    Inference { model_id: String, reason: String },

    #[error("Inference on {model_id} timed out after {}ms", after.as_millis())]
    Timeout { model_id: String, after: Duration },

    #[error("Swap already in progress for model: {0}")]
    SwapInProgress(String),

    #[error("Model discovery failed: {0}")]
    Discovery(String),

    #[error("Model {0} is built in and cannot be unloaded, swapped or removed")]
    Protected(String),
}

impl ModelError {
    pub fn load(model_id: &str, reason: impl ToString) -> Self {
        Self::Load { model_id: model_id.to_string(), reason: reason.to_string() }
    }

    pub fn inference(model_id: &str, reason: impl ToString) -> Self {
        Self::Inference { model_id: model_id.to_string(), reason: reason.to_string() }
    }

    /// Short machine-readable tag for event payloads and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownModel(_) => "unknown_model",
            Self::NotLoaded(_) => "not_loaded",
            Self::Load { .. } => "load",
            Self::Inference { .. } => "inference",
            Self::Timeout { .. } => "timeout",
            Self::SwapInProgress(_) => "swap_in_progress",
            Self::Discovery(_) => "discovery",
            Self::Protected(_) => "protected",
        }
    }
}

/// Failure inside a backend, before it is attributed to a model id.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("Unsupported format: {0}")]
    Unsupported(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

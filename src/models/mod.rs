//! Model discovery, loading, inference and hot-swap.
//!
//! A model id maps to a slot holding a version-tagged current instance.
//! Inference leases the current instance; swaps repoint the slot and let the
//! superseded instance drain before it is released.

mod artifact;
mod backend;
mod descriptor;
mod discovery;
mod drain;
mod error;
mod instance;
mod manager;
mod manifest;
mod swap;

pub use artifact::{confine, sha256_file, MappedArtifact};
pub use backend::{
    builtin_descriptor, render_completion, BackendRegistry, BuiltinBackend, GgufBackend, InferenceRequest, InferenceResponse,
    LoadedModel, ModelBackend, NativeBackend, OnnxBackend, BUILTIN_MODEL_ID, DEFAULT_MAX_TOKENS,
};
pub use descriptor::{ModelCapability, ModelDescriptor, ModelFormat};
pub use discovery::ModelScanner;
pub use drain::{DrainError, FlightGuard, FlightTracker};
pub use error::{BackendError, ModelError};
pub use instance::{InstanceState, Lease, ModelInstance};
pub use manager::{ModelManager, ModelManagerConfig, ModelStatus};
pub use manifest::ModelManifest;
pub use swap::SwapResult;

//! Loaded, version-tagged model instances.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::backend::LoadedModel;
use super::descriptor::ModelDescriptor;
use super::drain::{FlightGuard, FlightTracker};

/// Lifecycle state of a model id or instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Loading,
    Ready,
    Unloading,
    Unloaded,
    Failed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Unloading => "unloading",
            Self::Unloaded => "unloaded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A runnable model bound to a logical id and a version tag.
///
/// Instances are immutable apart from their state; a swap installs a new
/// instance rather than mutating the current one.
pub struct ModelInstance {
    model_id: String,
    version: u64,
    descriptor: Arc<ModelDescriptor>,
    model: Box<dyn LoadedModel>,
    flights: Arc<FlightTracker>,
    state: watch::Sender<InstanceState>,
    loaded_at: DateTime<Utc>,
}

impl ModelInstance {
    pub(crate) fn new(
        model_id: impl Into<String>,
        version: u64,
        descriptor: Arc<ModelDescriptor>,
        model: Box<dyn LoadedModel>,
    ) -> Self {
        let (state, _) = watch::channel(InstanceState::Ready);
        Self {
            model_id: model_id.into(),
            version,
            descriptor,
            model,
            flights: Arc::new(FlightTracker::new()),
            state,
            loaded_at: Utc::now(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> InstanceState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == InstanceState::Ready
    }

    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    pub fn memory_bytes(&self) -> usize {
        self.model.memory_bytes()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub(crate) fn model(&self) -> &dyn LoadedModel {
        self.model.as_ref()
    }

    /// Take a lease for one call. Callers must hold the slot read lock so the
    /// lease cannot race a repoint.
    pub(crate) fn lease(self: &Arc<Self>) -> Lease {
        Lease {
            _guard: self.flights.track(),
            instance: Arc::clone(self),
        }
    }

    /// Stop accepting new leases. In-flight calls continue.
    pub(crate) fn retire(&self) {
        self.state.send_replace(InstanceState::Unloading);
    }

    /// Wait for in-flight calls, then release backend resources.
    pub(crate) async fn release(&self) {
        self.retire();
        self.flights.drained().await;
        if let Err(e) = self.model.unload().await {
            warn!(model_id = %self.model_id, version = self.version, error = %e, "Backend unload failed");
        }
        self.state.send_replace(InstanceState::Unloaded);
        debug!(model_id = %self.model_id, version = self.version, "Instance released");
    }

    /// Resolve once the instance has been released.
    pub async fn wait_released(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == InstanceState::Unloaded).await;
    }
}

impl fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelInstance")
            .field("model_id", &self.model_id)
            .field("version", &self.version)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// One in-flight call against an instance. Keeps the instance alive and
/// counted until dropped.
pub struct Lease {
    instance: Arc<ModelInstance>,
    _guard: FlightGuard,
}

impl Lease {
    pub fn instance(&self) -> &Arc<ModelInstance> {
        &self.instance
    }
}

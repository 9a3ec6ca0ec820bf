//! Model lifecycle: discovery, single-flight loading, leased inference.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn, Instrument};

use super::backend::{
    builtin_descriptor, BackendRegistry, EchoModel, InferenceRequest, InferenceResponse,
    BUILTIN_MODEL_ID,
};
use super::descriptor::{ModelDescriptor, ModelFormat};
use super::discovery::ModelScanner;
use super::error::ModelError;
use super::instance::{InstanceState, Lease, ModelInstance};
use crate::bus::{panic_message, topics, EventBus};
use crate::telemetry::{self, InferenceSpan, SpanExt};

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<ModelInstance>, ModelError>>>;

#[derive(Debug, Clone)]
pub struct ModelManagerConfig {
    pub models_dir: PathBuf,
    /// Load on first `infer` instead of failing with `NotLoaded`.
    pub auto_load: bool,
    /// Caller wait limit when a request carries none.
    pub inference_timeout: Duration,
    /// Hash every artifact during discovery.
    pub verify_hashes: bool,
}

impl Default for ModelManagerConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            auto_load: false,
            inference_timeout: Duration::from_secs(30),
            verify_hashes: false,
        }
    }
}

/// Snapshot of one model id.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub model_id: String,
    pub format: Option<ModelFormat>,
    pub path: Option<PathBuf>,
    pub state: InstanceState,
    pub version: Option<u64>,
    pub in_flight: usize,
    pub last_error: Option<String>,
}

pub(super) struct SlotControl {
    pub(super) state: InstanceState,
    pub(super) pending: Option<SharedLoad>,
    pub(super) last_error: Option<String>,
}

/// Per-id indirection: a stable id pointing at the current instance.
///
/// Lock order is `control` then `current`. Neither is held across an await.
pub(super) struct ModelSlot {
    pub(super) current: RwLock<Option<Arc<ModelInstance>>>,
    pub(super) control: Mutex<SlotControl>,
}

impl ModelSlot {
    fn new() -> Self {
        Self {
            current: RwLock::new(None),
            control: Mutex::new(SlotControl {
                state: InstanceState::Unloaded,
                pending: None,
                last_error: None,
            }),
        }
    }

    /// Lease the current instance if it is Ready.
    pub(super) fn lease(&self) -> Option<Lease> {
        let current = self.current.read();
        current
            .as_ref()
            .filter(|instance| instance.is_ready())
            .map(|instance| instance.lease())
    }
}

pub(super) struct ManagerInner {
    pub(super) config: ModelManagerConfig,
    pub(super) bus: EventBus,
    backends: BackendRegistry,
    descriptors: RwLock<HashMap<String, Arc<ModelDescriptor>>>,
    slots: DashMap<String, Arc<ModelSlot>>,
    next_version: AtomicU64,
    /// Ids with a swap or unload running.
    pub(super) exclusive: DashSet<String>,
}

impl ManagerInner {
    pub(super) fn descriptor(&self, id: &str) -> Option<Arc<ModelDescriptor>> {
        self.descriptors.read().get(id).cloned()
    }

    pub(super) fn set_descriptor(&self, descriptor: Arc<ModelDescriptor>) {
        self.descriptors.write().insert(descriptor.id.clone(), descriptor);
    }

    pub(super) fn slot(&self, id: &str) -> Arc<ModelSlot> {
        self.slots
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(ModelSlot::new()))
            .clone()
    }

    pub(super) fn existing_slot(&self, id: &str) -> Option<Arc<ModelSlot>> {
        self.slots.get(id).map(|slot| slot.clone())
    }

    pub(super) fn next_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    pub(super) fn emit(&self, topic: &str, payload: serde_json::Value) {
        self.bus.publish(topic, payload);
    }

    /// Install the built-in model as Ready. Version 0 never collides with
    /// loaded instances, whose versions start at 1.
    fn install_builtin(&self) {
        let descriptor = Arc::new(builtin_descriptor());
        let instance = Arc::new(ModelInstance::new(
            BUILTIN_MODEL_ID,
            0,
            Arc::clone(&descriptor),
            Box::new(EchoModel),
        ));
        self.set_descriptor(descriptor);
        let slot = self.slot(BUILTIN_MODEL_ID);
        let mut control = slot.control.lock();
        *slot.current.write() = Some(instance);
        control.state = InstanceState::Ready;
    }

    pub(super) fn ensure_not_builtin(id: &str) -> Result<(), ModelError> {
        if id == BUILTIN_MODEL_ID {
            return Err(ModelError::Protected(id.to_string()));
        }
        Ok(())
    }

    /// Run the backend load for `descriptor` and wrap it as an instance.
    pub(super) async fn build_instance(
        &self,
        id: &str,
        descriptor: Arc<ModelDescriptor>,
        version: u64,
    ) -> Result<Arc<ModelInstance>, ModelError> {
        let backend = self
            .backends
            .get(descriptor.format)
            .ok_or_else(|| ModelError::load(id, format!("no backend for format {}", descriptor.format)))?;

        let started = Instant::now();
        let result = AssertUnwindSafe(backend.load(&descriptor)).catch_unwind().await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let model = match result {
            Ok(Ok(model)) => model,
            Ok(Err(e)) => {
                telemetry::record_model_load(descriptor.format.as_str(), false, elapsed_ms);
                return Err(ModelError::load(id, e));
            }
            Err(panic) => {
                telemetry::record_model_load(descriptor.format.as_str(), false, elapsed_ms);
                return Err(ModelError::load(
                    id,
                    format!("backend panicked: {}", panic_message(panic.as_ref())),
                ));
            }
        };
        telemetry::record_model_load(descriptor.format.as_str(), true, elapsed_ms);
        info!(
            model_id = %id,
            version,
            format = %descriptor.format,
            memory_bytes = model.memory_bytes(),
            load_ms = elapsed_ms as u64,
            "Model instance built"
        );
        Ok(Arc::new(ModelInstance::new(id, version, descriptor, model)))
    }

    /// Start a load task and record it as the slot's pending load.
    fn start_load(
        self: &Arc<Self>,
        id: &str,
        descriptor: Arc<ModelDescriptor>,
        control: &mut SlotControl,
    ) -> (SharedLoad, u64) {
        let version = self.next_version();
        let inner = Arc::clone(self);
        let model_id = id.to_string();
        // Spawned so a dropped caller cannot cancel a started load.
        let task = tokio::spawn(async move {
            let result = inner.build_instance(&model_id, descriptor, version).await;
            inner.finish_load(&model_id, version, &result);
            result
        });
        let failed_id = id.to_string();
        let shared = async move {
            task.await.unwrap_or_else(|e| {
                Err(ModelError::load(&failed_id, format!("load task aborted: {}", e)))
            })
        }
        .boxed()
        .shared();

        control.state = InstanceState::Loading;
        control.pending = Some(shared.clone());
        (shared, version)
    }

    fn finish_load(&self, id: &str, version: u64, result: &Result<Arc<ModelInstance>, ModelError>) {
        let slot = self.slot(id);
        {
            let mut control = slot.control.lock();
            control.pending = None;
            match result {
                Ok(instance) => {
                    *slot.current.write() = Some(Arc::clone(instance));
                    control.state = InstanceState::Ready;
                    control.last_error = None;
                }
                Err(e) => {
                    control.state = InstanceState::Failed;
                    control.last_error = Some(e.to_string());
                }
            }
        }
        match result {
            Ok(instance) => {
                info!(model_id = %id, version, "Model ready");
                self.emit(
                    topics::MODEL_READY,
                    json!({
                        "model_id": id,
                        "version": version,
                        "format": instance.descriptor().format.as_str(),
                    }),
                );
            }
            Err(e) => {
                error!(model_id = %id, version, error = %e, "Model load failed");
                self.emit(
                    topics::MODEL_FAILED,
                    json!({ "model_id": id, "version": version, "error": e.to_string() }),
                );
            }
        }
    }
}

/// Owns every model instance and serves inference against them.
#[derive(Clone)]
pub struct ModelManager {
    pub(super) inner: Arc<ManagerInner>,
}

impl ModelManager {
    /// Create a manager with only the built-in `default` model available.
    pub fn new(config: ModelManagerConfig, bus: EventBus, backends: BackendRegistry) -> Self {
        let inner = Arc::new(ManagerInner {
            config,
            bus,
            backends,
            descriptors: RwLock::new(HashMap::new()),
            slots: DashMap::new(),
            next_version: AtomicU64::new(1),
            exclusive: DashSet::new(),
        });
        inner.install_builtin();
        Self { inner }
    }

    pub fn config(&self) -> &ModelManagerConfig {
        &self.inner.config
    }

    /// Rescan the models root and replace the descriptor set.
    ///
    /// Loaded instances keep the descriptor they were built from. The
    /// built-in model is always kept; artifacts claiming its id are skipped.
    pub async fn discover(&self) -> Result<Vec<ModelDescriptor>, ModelError> {
        let scanner = ModelScanner::new(&self.inner.config.models_dir)
            .with_hashing(self.inner.config.verify_hashes);
        let mut found = tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .map_err(|e| ModelError::Discovery(format!("scan task failed: {}", e)))??;
        found.retain(|d| {
            let reserved = d.id == BUILTIN_MODEL_ID;
            if reserved {
                warn!(path = %d.path.display(), "Skipping artifact that uses the reserved model id");
            }
            !reserved
        });

        {
            let mut descriptors = self.inner.descriptors.write();
            descriptors.retain(|id, _| id == BUILTIN_MODEL_ID);
            for descriptor in &found {
                descriptors.insert(descriptor.id.clone(), Arc::new(descriptor.clone()));
            }
        }
        let ids: Vec<&str> = found.iter().map(|d| d.id.as_str()).collect();
        info!(count = found.len(), root = %self.inner.config.models_dir.display(), "Model discovery complete");
        self.inner.emit(
            topics::MODEL_DISCOVERED,
            json!({ "count": found.len(), "model_ids": ids }),
        );
        Ok(found)
    }

    /// Make a descriptor known without scanning.
    pub fn add_descriptor(&self, descriptor: ModelDescriptor) {
        self.inner.set_descriptor(Arc::new(descriptor));
    }

    pub fn descriptor(&self, id: &str) -> Option<ModelDescriptor> {
        self.inner.descriptor(id).map(|d| (*d).clone())
    }

    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        let mut all: Vec<_> = self
            .inner
            .descriptors
            .read()
            .values()
            .map(|d| (**d).clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Load `id`, or join a load already running for it.
    ///
    /// An explicit load retries a Failed model.
    pub async fn load(&self, id: &str) -> Result<Arc<ModelInstance>, ModelError> {
        let descriptor = self
            .inner
            .descriptor(id)
            .ok_or_else(|| ModelError::UnknownModel(id.to_string()))?;
        let slot = self.inner.slot(id);

        let (pending, started) = {
            let mut control = slot.control.lock();
            if let Some(instance) = slot.current.read().as_ref().filter(|i| i.is_ready()) {
                return Ok(Arc::clone(instance));
            }
            match &control.pending {
                Some(pending) => (pending.clone(), None),
                None => {
                    let (pending, version) = self.inner.start_load(id, descriptor, &mut control);
                    (pending, Some(version))
                }
            }
        };
        if let Some(version) = started {
            info!(model_id = %id, version, "Loading model");
            self.inner
                .emit(topics::MODEL_LOADING, json!({ "model_id": id, "version": version }));
        }
        pending.await
    }

    /// Run one inference call against the current instance of `id`.
    ///
    /// On timeout the caller gets `Timeout` while the call keeps running in
    /// the background, still holding its lease.
    pub async fn infer(
        &self,
        id: &str,
        request: InferenceRequest,
    ) -> Result<InferenceResponse, ModelError> {
        let lease = match self.inner.existing_slot(id).and_then(|slot| slot.lease()) {
            Some(lease) => lease,
            None => self.lease_or_load(id).await?,
        };
        let version = lease.instance().version();
        let timeout = request.timeout.unwrap_or(self.inner.config.inference_timeout);
        let span = InferenceSpan::new(id, version);
        let started = Instant::now();

        let task = tokio::spawn(
            async move {
                let lease = lease;
                lease.instance().model().infer(&request).await
            }
            .instrument(span.clone()),
        );
        let outcome = match tokio::time::timeout(timeout, task).await {
            Err(_) => Err(ModelError::Timeout { model_id: id.to_string(), after: timeout }),
            Ok(Err(join)) => Err(ModelError::inference(id, format!("inference task failed: {}", join))),
            Ok(Ok(Err(e))) => Err(ModelError::inference(id, e)),
            Ok(Ok(Ok(text))) => Ok(text),
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        span.record("latency_ms", latency_ms);
        span.record_result(&outcome);
        telemetry::record_inference(id, outcome.is_ok(), latency_ms as f64);

        match outcome {
            Ok(text) => {
                let tokens = text.split_whitespace().count();
                self.inner.emit(
                    topics::MODEL_INFER,
                    json!({ "model_id": id, "version": version, "tokens": tokens, "latency_ms": latency_ms }),
                );
                Ok(InferenceResponse { model_id: id.to_string(), version, tokens, text, latency_ms })
            }
            Err(e) => {
                warn!(model_id = %id, version, error = %e, "Inference failed");
                self.inner.emit(
                    topics::MODEL_ERROR,
                    json!({
                        "model_id": id,
                        "version": version,
                        "kind": e.kind(),
                        "error": e.to_string(),
                    }),
                );
                Err(e)
            }
        }
    }

    async fn lease_or_load(&self, id: &str) -> Result<Lease, ModelError> {
        let slot = self.inner.existing_slot(id);
        if slot.is_none() && self.inner.descriptor(id).is_none() {
            return Err(ModelError::UnknownModel(id.to_string()));
        }
        if let Some(slot) = &slot {
            let control = slot.control.lock();
            if control.state == InstanceState::Failed {
                return Err(ModelError::load(
                    id,
                    control.last_error.clone().unwrap_or_else(|| "previous load failed".into()),
                ));
            }
        }
        if !self.inner.config.auto_load {
            return Err(ModelError::NotLoaded(id.to_string()));
        }
        self.load(id).await?;
        self.inner
            .existing_slot(id)
            .and_then(|slot| slot.lease())
            .ok_or_else(|| ModelError::NotLoaded(id.to_string()))
    }

    /// Unload the current instance once its in-flight calls finish.
    pub async fn unload(&self, id: &str) -> Result<(), ModelError> {
        ManagerInner::ensure_not_builtin(id)?;
        let permit = ExclusivePermit::acquire(&self.inner, id)?;
        let slot = self
            .inner
            .existing_slot(id)
            .ok_or_else(|| ModelError::NotLoaded(id.to_string()))?;
        let instance = {
            let mut control = slot.control.lock();
            let taken = slot.current.write().take();
            let Some(instance) = taken else {
                return Err(ModelError::NotLoaded(id.to_string()));
            };
            control.state = InstanceState::Unloading;
            instance.retire();
            instance
        };
        info!(model_id = %id, version = instance.version(), in_flight = instance.in_flight(), "Unloading model");

        let inner = Arc::clone(&self.inner);
        let model_id = id.to_string();
        tokio::spawn(async move {
            let _permit = permit;
            instance.release().await;
            {
                let mut control = slot.control.lock();
                if control.state == InstanceState::Unloading {
                    control.state = InstanceState::Unloaded;
                }
            }
            inner.emit(
                topics::MODEL_UNLOADED,
                json!({ "model_id": model_id, "version": instance.version(), "reason": "unload" }),
            );
        })
        .await
        .map_err(|e| ModelError::load(id, format!("unload task failed: {}", e)))
    }

    /// Forget `id`: unload it if loaded, then drop its descriptor.
    ///
    /// A later discovery pass brings it back if the artifact is still there.
    pub async fn remove(&self, id: &str) -> Result<(), ModelError> {
        ManagerInner::ensure_not_builtin(id)?;
        let known = self.inner.descriptor(id).is_some();
        if self.current(id).is_some() {
            self.unload(id).await?;
        } else if !known {
            return Err(ModelError::UnknownModel(id.to_string()));
        }
        self.inner.descriptors.write().remove(id);
        self.inner.slots.remove_if(id, |_, slot| {
            let control = slot.control.lock();
            control.pending.is_none() && slot.current.read().is_none()
        });
        info!(model_id = %id, "Model removed");
        self.inner.emit(topics::MODEL_REMOVED, json!({ "model_id": id }));
        Ok(())
    }

    /// The instance new calls for `id` would use.
    pub fn current(&self, id: &str) -> Option<Arc<ModelInstance>> {
        self.inner
            .existing_slot(id)
            .and_then(|slot| slot.current.read().clone())
    }

    pub fn state(&self, id: &str) -> InstanceState {
        self.inner
            .existing_slot(id)
            .map(|slot| slot.control.lock().state)
            .unwrap_or(InstanceState::Unloaded)
    }

    /// Every known id with its state, sorted by id.
    pub fn status(&self) -> Vec<ModelStatus> {
        let mut ids: Vec<String> = self.inner.descriptors.read().keys().cloned().collect();
        for entry in self.inner.slots.iter() {
            if !ids.contains(entry.key()) {
                ids.push(entry.key().clone());
            }
        }
        ids.sort();
        ids.into_iter()
            .map(|id| {
                let descriptor = self.inner.descriptor(&id);
                let (state, last_error) = self
                    .inner
                    .existing_slot(&id)
                    .map(|slot| {
                        let control = slot.control.lock();
                        (control.state, control.last_error.clone())
                    })
                    .unwrap_or((InstanceState::Unloaded, None));
                let current = self.current(&id);
                ModelStatus {
                    format: descriptor.as_ref().map(|d| d.format),
                    path: descriptor.as_ref().map(|d| d.path.clone()),
                    state,
                    version: current.as_ref().map(|i| i.version()),
                    in_flight: current.as_ref().map(|i| i.in_flight()).unwrap_or(0),
                    last_error,
                    model_id: id,
                }
            })
            .collect()
    }

    /// Unload every loaded model, waiting for in-flight calls.
    pub async fn shutdown(&self) {
        let loaded: Vec<String> = self
            .inner
            .slots
            .iter()
            .filter(|entry| entry.key() != BUILTIN_MODEL_ID && entry.value().current.read().is_some())
            .map(|entry| entry.key().clone())
            .collect();
        let unloads = loaded.iter().map(|id| async move {
            if let Err(e) = self.unload(id).await {
                warn!(model_id = %id, error = %e, "Unload during shutdown failed");
            }
        });
        futures::future::join_all(unloads).await;
        info!(count = loaded.len(), "Model manager shut down");
    }
}

/// Marks an id as undergoing a swap or unload. Released on drop.
pub(super) struct ExclusivePermit {
    inner: Arc<ManagerInner>,
    id: String,
}

impl ExclusivePermit {
    pub(super) fn acquire(inner: &Arc<ManagerInner>, id: &str) -> Result<Self, ModelError> {
        if !inner.exclusive.insert(id.to_string()) {
            return Err(ModelError::SwapInProgress(id.to_string()));
        }
        Ok(Self { inner: Arc::clone(inner), id: id.to_string() })
    }
}

impl Drop for ExclusivePermit {
    fn drop(&mut self) {
        self.inner.exclusive.remove(&self.id);
    }
}

//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hearth_agent::bus::EventBus;
use hearth_agent::memory::{
    InteractionFilter, InteractionRecord, MemoryError, MemoryStore, PruneStats, SqliteMemory,
    TaskFilter, TaskRecord, TaskStatus,
};
use hearth_agent::models::{
    BackendError, BackendRegistry, InferenceRequest, LoadedModel, ModelBackend, ModelDescriptor,
    ModelFormat, ModelManager, ModelManagerConfig,
};
use parking_lot::Mutex;

/// Counters shared between a [`ScriptedBackend`] and the test body.
#[derive(Default)]
pub struct BackendStats {
    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
    pub infers: AtomicUsize,
    pub last_prompt: Mutex<String>,
}

impl BackendStats {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn infers(&self) -> usize {
        self.infers.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> String {
        self.last_prompt.lock().clone()
    }
}

/// GGUF-format backend that never touches the file system.
///
/// Paths containing `broken` fail to load. Replies are `<file name>: <line>`,
/// where `<line>` is the last prompt line other than the trailing `AI:` cue.
pub struct ScriptedBackend {
    pub load_delay: Duration,
    pub infer_delay: Duration,
    pub stats: Arc<BackendStats>,
}

impl ScriptedBackend {
    pub fn new(load_delay: Duration, infer_delay: Duration) -> Self {
        Self { load_delay, infer_delay, stats: Arc::new(BackendStats::default()) }
    }
}

struct ScriptedModel {
    label: String,
    infer_delay: Duration,
    stats: Arc<BackendStats>,
}

#[async_trait]
impl LoadedModel for ScriptedModel {
    async fn infer(&self, request: &InferenceRequest) -> Result<String, BackendError> {
        tokio::time::sleep(self.infer_delay).await;
        if request.prompt.contains("explode") {
            return Err(BackendError::Execution("scripted failure".into()));
        }
        self.stats.infers.fetch_add(1, Ordering::SeqCst);
        *self.stats.last_prompt.lock() = request.prompt.clone();
        let line = request
            .prompt
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty() && *l != "AI:")
            .unwrap_or("");
        Ok(format!("{}: {}", self.label, line))
    }

    async fn unload(&self) -> Result<(), BackendError> {
        self.stats.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn memory_bytes(&self) -> usize {
        1024
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn format(&self) -> ModelFormat {
        ModelFormat::Gguf
    }

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn LoadedModel>, BackendError> {
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.load_delay).await;
        let label = descriptor
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if label.contains("broken") {
            return Err(BackendError::InvalidArtifact(format!("{} is broken", label)));
        }
        Ok(Box::new(ScriptedModel {
            label,
            infer_delay: self.infer_delay,
            stats: Arc::clone(&self.stats),
        }))
    }
}

pub fn scripted_registry(backend: ScriptedBackend) -> (BackendRegistry, Arc<BackendStats>) {
    let stats = Arc::clone(&backend.stats);
    let mut registry = BackendRegistry::empty();
    registry.register(Arc::new(backend));
    (registry, stats)
}

pub fn descriptor(id: &str, file: &str) -> ModelDescriptor {
    ModelDescriptor::from_path(id, PathBuf::from("/models").join(file), ModelFormat::Gguf)
}

/// Manager over a scripted backend with `ids` already described.
pub fn scripted_manager(
    config: ModelManagerConfig,
    backend: ScriptedBackend,
    ids: &[&str],
) -> (ModelManager, EventBus, Arc<BackendStats>) {
    let bus = EventBus::new();
    let (registry, stats) = scripted_registry(backend);
    let manager = ModelManager::new(config, bus.clone(), registry);
    for id in ids {
        manager.add_descriptor(descriptor(id, &format!("{}.gguf", id)));
    }
    (manager, bus, stats)
}

/// Minimal valid GGUF header.
pub fn gguf_bytes() -> Vec<u8> {
    let mut bytes = b"GGUF".to_vec();
    bytes.extend_from_slice(&3u32.to_le_bytes());
    bytes.extend_from_slice(&4u64.to_le_bytes());
    bytes.extend_from_slice(&2u64.to_le_bytes());
    bytes
}

pub fn write_gguf(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, gguf_bytes()).unwrap();
    path
}

/// Memory store whose reads or writes can be switched to fail.
pub struct FlakyMemory {
    inner: SqliteMemory,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
}

impl FlakyMemory {
    pub async fn new() -> Self {
        Self {
            inner: SqliteMemory::open_in_memory().await.unwrap(),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool) -> Result<(), MemoryError> {
        if flag.load(Ordering::SeqCst) {
            Err(MemoryError::StorageIo("disk unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MemoryStore for FlakyMemory {
    async fn append_interaction(&self, record: InteractionRecord) -> Result<(), MemoryError> {
        Self::check(&self.fail_writes)?;
        self.inner.append_interaction(record).await
    }

    async fn append_task(&self, task: TaskRecord) -> Result<(), MemoryError> {
        Self::check(&self.fail_writes)?;
        self.inner.append_task(task).await
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<(), MemoryError> {
        Self::check(&self.fail_writes)?;
        self.inner.update_task_status(id, status).await
    }

    async fn query_interactions(
        &self,
        filter: InteractionFilter,
    ) -> Result<Vec<InteractionRecord>, MemoryError> {
        Self::check(&self.fail_reads)?;
        self.inner.query_interactions(filter).await
    }

    async fn query_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskRecord>, MemoryError> {
        Self::check(&self.fail_reads)?;
        self.inner.query_tasks(filter).await
    }

    async fn claim_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<TaskRecord>, MemoryError> {
        Self::check(&self.fail_writes)?;
        self.inner.claim_due_tasks(now).await
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<PruneStats, MemoryError> {
        Self::check(&self.fail_writes)?;
        self.inner.prune(cutoff).await
    }
}

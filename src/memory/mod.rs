//! Durable conversation and task memory.
//!
//! [`MemoryStore`] is the seam the orchestrator depends on; [`SqliteMemory`]
//! is the shipped implementation. Interactions are append-only. Tasks carry
//! a status that moves forward through `pending -> running -> done|failed`.

mod records;
mod sqlite;

pub use records::{
    InteractionFilter, InteractionRecord, ParseEnumError, PruneStats, Role, TaskFilter,
    TaskRecord, TaskStatus,
};
pub use sqlite::SqliteMemory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Memory store errors.
#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    #[error("Duplicate {table} id: {id}")]
    DuplicateKey { table: &'static str, id: String },

    #[error("No {table} record with id: {id}")]
    NotFound { table: &'static str, id: String },

    #[error("Storage I/O failed: {0}")]
    StorageIo(String),

    #[error("Record serialization failed: {0}")]
    Serialization(String),
}

/// Durable store for interactions and tasks.
///
/// A successful append is visible to every query issued after it returns,
/// and survives a process restart.
#[async_trait]
pub trait MemoryStore: Send + Sync + 'static {
    async fn append_interaction(&self, record: InteractionRecord) -> Result<(), MemoryError>;

    async fn append_task(&self, task: TaskRecord) -> Result<(), MemoryError>;

    /// Set a task's status and bump its `updated_at`.
    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<(), MemoryError>;

    /// Matching interactions in chronological order.
    async fn query_interactions(
        &self,
        filter: InteractionFilter,
    ) -> Result<Vec<InteractionRecord>, MemoryError>;

    async fn query_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskRecord>, MemoryError>;

    /// Atomically move every pending task due at `now` to `running` and
    /// return it. A task is claimed by at most one caller.
    async fn claim_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<TaskRecord>, MemoryError>;

    /// Delete interactions older than `cutoff` and terminal tasks last
    /// updated before it.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<PruneStats, MemoryError>;

    /// The last `n` interactions, oldest first.
    async fn recent_interactions(&self, n: usize) -> Result<Vec<InteractionRecord>, MemoryError> {
        self.query_interactions(InteractionFilter::recent(n)).await
    }
}

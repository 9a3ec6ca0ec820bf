//! SQLite-backed [`MemoryStore`].
//!
//! All statements run on tokio-rusqlite's single background thread, so
//! writes are serialized and a completed call is visible to every later one.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Row};
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use super::records::{
    InteractionFilter, InteractionRecord, PruneStats, TaskFilter, TaskRecord, TaskStatus,
};
use super::{MemoryError, MemoryStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS interactions (
    id        TEXT PRIMARY KEY,
    role      TEXT NOT NULL,
    content   TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    model_id  TEXT
);
CREATE INDEX IF NOT EXISTS idx_interactions_timestamp ON interactions(timestamp);

CREATE TABLE IF NOT EXISTS tasks (
    id         TEXT PRIMARY KEY,
    status     TEXT NOT NULL,
    payload    TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    execute_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, execute_at);
";

/// Maps both `Connection::open` errors (`rusqlite::Error`) and
/// `call`/`close` errors (`tokio_rusqlite::Error`).
fn storage_err(e: impl std::fmt::Display) -> MemoryError {
    MemoryError::StorageIo(e.to_string())
}

/// Fixed-width UTC text so lexical order equals chronological order.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_err(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn parse_ts(row: &Row<'_>, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(column, e))
}

fn interaction_from_row(row: &Row<'_>) -> rusqlite::Result<InteractionRecord> {
    let role: String = row.get(1)?;
    Ok(InteractionRecord {
        id: row.get(0)?,
        role: role.parse().map_err(|e| conversion_err(1, e))?,
        content: row.get(2)?,
        timestamp: parse_ts(row, 3)?,
        model_id: row.get(4)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status: String = row.get(1)?;
    let payload: String = row.get(2)?;
    let execute_at = match row.get::<_, Option<String>>(5)? {
        Some(_) => Some(parse_ts(row, 5)?),
        None => None,
    };
    Ok(TaskRecord {
        id: row.get(0)?,
        status: status.parse().map_err(|e| conversion_err(1, e))?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_err(2, e))?,
        created_at: parse_ts(row, 3)?,
        updated_at: parse_ts(row, 4)?,
        execute_at,
    })
}

const TASK_COLUMNS: &str = "id, status, payload, created_at, updated_at, execute_at";

/// Memory store persisted to a single SQLite database file.
#[derive(Clone)]
pub struct SqliteMemory {
    conn: Connection,
}

impl SqliteMemory {
    /// Open or create the database at `path`, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MemoryError::StorageIo(format!("{}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path).await.map_err(storage_err)?;
        let store = Self { conn };
        store.init(true).await?;
        info!(path = %path.display(), "Memory store opened");
        Ok(store)
    }

    /// Non-durable store for tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory().await.map_err(storage_err)?;
        let store = Self { conn };
        store.init(false).await?;
        Ok(store)
    }

    async fn init(&self, durable: bool) -> Result<(), MemoryError> {
        self.conn
            .call(move |conn| {
                if durable {
                    let _mode: String =
                        conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
                    conn.execute_batch("PRAGMA synchronous=FULL;")?;
                }
                conn.execute_batch(SCHEMA)?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(storage_err)
    }

    /// Close the underlying connection, flushing pending writes.
    pub async fn close(self) -> Result<(), MemoryError> {
        self.conn.close().await.map_err(storage_err)
    }
}

#[async_trait]
impl MemoryStore for SqliteMemory {
    async fn append_interaction(&self, record: InteractionRecord) -> Result<(), MemoryError> {
        let id = record.id.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO interactions (id, role, content, timestamp, model_id)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        record.id,
                        record.role.as_str(),
                        record.content,
                        ts(&record.timestamp),
                        record.model_id
                    ],
                )?;
                Ok::<_, rusqlite::Error>(n)
            })
            .await
            .map_err(storage_err)?;
        if inserted == 0 {
            return Err(MemoryError::DuplicateKey { table: "interactions", id });
        }
        debug!(id = %id, "Interaction persisted");
        Ok(())
    }

    async fn append_task(&self, task: TaskRecord) -> Result<(), MemoryError> {
        let id = task.id.clone();
        let payload = serde_json::to_string(&task.payload)
            .map_err(|e| MemoryError::Serialization(e.to_string()))?;
        let inserted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO tasks (id, status, payload, created_at, updated_at, execute_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        task.id,
                        task.status.as_str(),
                        payload,
                        ts(&task.created_at),
                        ts(&task.updated_at),
                        task.execute_at.as_ref().map(ts)
                    ],
                )?;
                Ok::<_, rusqlite::Error>(n)
            })
            .await
            .map_err(storage_err)?;
        if inserted == 0 {
            return Err(MemoryError::DuplicateKey { table: "tasks", id });
        }
        debug!(id = %id, "Task persisted");
        Ok(())
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<(), MemoryError> {
        let task_id = id.to_string();
        let now = ts(&Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![status.as_str(), now, task_id],
                )?;
                Ok::<_, rusqlite::Error>(n)
            })
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(MemoryError::NotFound { table: "tasks", id: id.to_string() });
        }
        Ok(())
    }

    async fn query_interactions(
        &self,
        filter: InteractionFilter,
    ) -> Result<Vec<InteractionRecord>, MemoryError> {
        self.conn
            .call(move |conn| {
                let mut clauses: Vec<&str> = Vec::new();
                let mut args: Vec<rusqlite::types::Value> = Vec::new();
                if let Some(role) = filter.role {
                    clauses.push("role = ?");
                    args.push(role.as_str().to_string().into());
                }
                if let Some(model_id) = filter.model_id {
                    clauses.push("model_id = ?");
                    args.push(model_id.into());
                }
                if let Some(since) = filter.since {
                    clauses.push("timestamp >= ?");
                    args.push(ts(&since).into());
                }
                if let Some(until) = filter.until {
                    clauses.push("timestamp < ?");
                    args.push(ts(&until).into());
                }
                if let Some(text) = filter.contains {
                    clauses.push("instr(lower(content), lower(?)) > 0");
                    args.push(text.into());
                }
                let where_sql = if clauses.is_empty() {
                    String::new()
                } else {
                    format!("WHERE {}", clauses.join(" AND "))
                };
                let limit = filter.limit.map(|n| n as i64).unwrap_or(-1);
                args.push(limit.into());

                // Newest first so LIMIT keeps the most recent, then reverse.
                let sql = format!(
                    "SELECT id, role, content, timestamp, model_id FROM interactions {}
                     ORDER BY timestamp DESC, rowid DESC LIMIT ?",
                    where_sql
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt
                    .query_map(params_from_iter(args), interaction_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.reverse();
                Ok::<_, rusqlite::Error>(rows)
            })
            .await
            .map_err(storage_err)
    }

    async fn query_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskRecord>, MemoryError> {
        self.conn
            .call(move |conn| {
                let limit = filter.limit.map(|n| n as i64).unwrap_or(-1);
                let status = filter.status.map(|s| s.as_str().to_string());
                let sql = format!(
                    "SELECT {} FROM tasks WHERE (?1 IS NULL OR status = ?1)
                     ORDER BY created_at ASC, rowid ASC LIMIT ?2",
                    TASK_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![status, limit], task_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok::<_, rusqlite::Error>(rows)
            })
            .await
            .map_err(storage_err)
    }

    async fn claim_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<TaskRecord>, MemoryError> {
        let now_ts = ts(&now);
        let claimed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut due = {
                    let sql = format!(
                        "SELECT {} FROM tasks
                         WHERE status = 'pending' AND (execute_at IS NULL OR execute_at <= ?1)
                         ORDER BY COALESCE(execute_at, created_at) ASC, rowid ASC",
                        TASK_COLUMNS
                    );
                    let mut stmt = tx.prepare(&sql)?;
                    let rows = stmt
                        .query_map(params![now_ts], task_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                };
                for task in &mut due {
                    tx.execute(
                        "UPDATE tasks SET status = 'running', updated_at = ?1 WHERE id = ?2",
                        params![now_ts, task.id],
                    )?;
                    task.status = TaskStatus::Running;
                    task.updated_at = now;
                }
                tx.commit()?;
                Ok::<_, rusqlite::Error>(due)
            })
            .await
            .map_err(storage_err)?;
        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed due tasks");
        }
        Ok(claimed)
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<PruneStats, MemoryError> {
        let cutoff_ts = ts(&cutoff);
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let interactions = tx.execute(
                    "DELETE FROM interactions WHERE timestamp < ?1",
                    params![cutoff_ts],
                )?;
                let tasks = tx.execute(
                    "DELETE FROM tasks WHERE status IN ('done', 'failed') AND updated_at < ?1",
                    params![cutoff_ts],
                )?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>(PruneStats { interactions, tasks })
            })
            .await
            .map_err(storage_err)
    }
}

//! Background loops: due-task scheduling and memory maintenance.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::OrchestratorInner;
use crate::bus::topics;

/// Claim due tasks every `task_poll_interval` and publish each on `task.due`.
pub(super) async fn scheduler(inner: Arc<OrchestratorInner>) {
    let period = inner.config.task_poll_interval;
    let mut ticker = interval_at(Instant::now(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match inner.memory.claim_due_tasks(Utc::now()).await {
            Ok(tasks) => {
                for task in tasks {
                    debug!(task_id = %task.id, "Task due");
                    inner.bus.publish(
                        topics::TASK_DUE,
                        json!({ "task_id": task.id, "payload": task.payload }),
                    );
                }
            }
            Err(e) => warn!(error = %e, "Task scheduler poll failed"),
        }
    }
    debug!("Task scheduler stopped");
}

/// Prune memory every `prune_interval`. The first pass runs one period
/// after start.
pub(super) async fn maintenance(inner: Arc<OrchestratorInner>) {
    let period = inner.config.prune_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let retention = chrono::Duration::from_std(inner.config.retention)
        .unwrap_or_else(|_| chrono::Duration::days(1));

    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let cutoff = Utc::now() - retention;
        match inner.memory.prune(cutoff).await {
            Ok(stats) => {
                info!(interactions = stats.interactions, tasks = stats.tasks, "Memory pruned");
                inner.bus.publish(
                    topics::MEMORY_PRUNED,
                    json!({
                        "interactions": stats.interactions,
                        "tasks": stats.tasks,
                        "cutoff": cutoff.to_rfc3339(),
                    }),
                );
            }
            Err(e) => warn!(error = %e, "Memory maintenance failed"),
        }
    }
    debug!("Memory maintenance stopped");
}

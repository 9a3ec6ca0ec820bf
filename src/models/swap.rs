//! Hot-swap: replace a model's current instance without dropping calls.
//!
//! The replacement loads while the old instance keeps serving. The current
//! pointer is then repointed under the slot write lock, so every new lease
//! sees the new instance. The old instance drains in the background and is
//! released when its last in-flight call finishes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::descriptor::ModelDescriptor;
use super::error::ModelError;
use super::manager::{ExclusivePermit, ManagerInner, ModelManager};
use crate::bus::topics;
use crate::telemetry;

/// Outcome of a completed swap.
#[derive(Debug, Clone, Serialize)]
pub struct SwapResult {
    pub model_id: String,
    pub old_version: u64,
    pub new_version: u64,
    /// Calls still running on the old instance at the moment of repointing.
    pub in_flight_at_swap: usize,
    pub load_duration: Duration,
}

impl ModelManager {
    /// Replace the current instance of `id` with one built from `descriptor`.
    ///
    /// Fails with `NotLoaded` when `id` has no Ready instance and with
    /// `SwapInProgress` when another swap or unload of `id` is running. A
    /// failed replacement load leaves the old instance current.
    pub async fn swap(&self, id: &str, descriptor: ModelDescriptor) -> Result<SwapResult, ModelError> {
        ManagerInner::ensure_not_builtin(id)?;
        let permit = ExclusivePermit::acquire(&self.inner, id)?;
        let inner = Arc::clone(&self.inner);
        let model_id = id.to_string();
        // Spawned so the swap runs to completion even if the caller goes away.
        tokio::spawn(async move {
            let _permit = permit;
            inner.run_swap(&model_id, descriptor).await
        })
        .await
        .map_err(|e| ModelError::load(id, format!("swap task failed: {}", e)))?
    }
}

impl ManagerInner {
    async fn run_swap(&self, id: &str, descriptor: ModelDescriptor) -> Result<SwapResult, ModelError> {
        let slot = self
            .existing_slot(id)
            .ok_or_else(|| ModelError::NotLoaded(id.to_string()))?;
        let old = slot
            .current
            .read()
            .clone()
            .filter(|instance| instance.is_ready())
            .ok_or_else(|| ModelError::NotLoaded(id.to_string()))?;

        let descriptor = Arc::new(ModelDescriptor { id: id.to_string(), ..descriptor });
        let new_version = self.next_version();
        info!(model_id = %id, old_version = old.version(), new_version, path = %descriptor.path.display(), "Swapping model");
        self.emit(
            topics::MODEL_LOADING,
            json!({ "model_id": id, "version": new_version, "swap": true }),
        );

        let started = Instant::now();
        let replacement = match self.build_instance(id, Arc::clone(&descriptor), new_version).await {
            Ok(instance) => instance,
            Err(e) => {
                warn!(model_id = %id, new_version, error = %e, "Swap aborted, keeping current instance");
                self.emit(
                    topics::MODEL_FAILED,
                    json!({
                        "model_id": id,
                        "version": new_version,
                        "error": e.to_string(),
                        "swap": true,
                    }),
                );
                return Err(e);
            }
        };
        let load_duration = started.elapsed();

        let in_flight_at_swap = {
            let mut current = slot.current.write();
            *current = Some(Arc::clone(&replacement));
            old.retire();
            old.in_flight()
        };
        self.set_descriptor(descriptor);
        telemetry::record_model_swap(id);
        info!(model_id = %id, old_version = old.version(), new_version, in_flight = in_flight_at_swap, "Model swapped");
        self.emit(
            topics::MODEL_SWAPPED,
            json!({
                "model_id": id,
                "old_version": old.version(),
                "new_version": new_version,
                "in_flight": in_flight_at_swap,
            }),
        );

        let bus = self.bus.clone();
        let model_id = id.to_string();
        let old_version = old.version();
        tokio::spawn(async move {
            old.release().await;
            info!(model_id = %model_id, version = old_version, "Superseded instance drained");
            bus.publish(
                topics::MODEL_UNLOADED,
                json!({ "model_id": model_id, "version": old_version, "reason": "swapped" }),
            );
        });

        Ok(SwapResult {
            model_id: id.to_string(),
            old_version,
            new_version,
            in_flight_at_swap,
            load_duration,
        })
    }
}

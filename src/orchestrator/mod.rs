//! The control loop tying memory, models and the bus together.
//!
//! The orchestrator reacts to `interaction.received` and `task.due`. Each
//! trigger runs one cycle: recall recent context, infer, persist, publish the
//! outcome. Context and persistence failures degrade the cycle; inference
//! failures end it.

mod context;
mod loops;

pub use context::build_prompt;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::bus::{
    handler_fn, topics, BusError, Event, EventBus, SubscriptionHandle, SubscriptionOptions,
};
use crate::memory::{InteractionRecord, MemoryError, MemoryStore, Role, TaskStatus};
use crate::models::{InferenceRequest, InferenceResponse, ModelError, ModelManager};
use crate::shutdown::{ShutdownCoordinator, ShutdownResult};
use crate::telemetry::{self, CycleSpan, SpanExt};

/// Subscriptions of the orchestrator run ahead of passive observers.
const HANDLER_PRIORITY: i32 = 10;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Model used when a trigger does not name one.
    pub default_model: String,
    /// How many past interactions to recall per cycle.
    pub context_interactions: usize,
    /// Word cap on recalled history.
    pub context_word_budget: usize,
    /// Inference wait limit per cycle.
    pub inference_timeout: Duration,
    pub task_poll_interval: Duration,
    pub prune_interval: Duration,
    /// Age after which interactions and finished tasks are pruned.
    pub retention: Duration,
    /// How long `shutdown` waits for running cycles.
    pub shutdown_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_model: "default".to_string(),
            context_interactions: 10,
            context_word_budget: 1024,
            inference_timeout: Duration::from_secs(30),
            task_poll_interval: Duration::from_secs(30),
            prune_interval: Duration::from_secs(600),
            retention: Duration::from_secs(86_400),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Request failed ({kind}): {message}")]
    Failed { kind: String, message: String },

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Orchestrator is not running")]
    NotRunning,

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Answer to [`Orchestrator::request`].
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub content: String,
    pub model_id: String,
    pub correlation_id: Uuid,
}

/// Result of one cycle that reached the model.
struct CycleOutcome {
    response: InferenceResponse,
    persistence_error: Option<MemoryError>,
}

pub(crate) struct OrchestratorInner {
    pub(crate) config: OrchestratorConfig,
    pub(crate) bus: EventBus,
    pub(crate) memory: Arc<dyn MemoryStore>,
    models: ModelManager,
    pub(crate) shutdown: ShutdownCoordinator,
    started: AtomicBool,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        bus: EventBus,
        memory: Arc<dyn MemoryStore>,
        models: ModelManager,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                bus,
                memory,
                models,
                shutdown: ShutdownCoordinator::new(),
                started: AtomicBool::new(false),
                subscriptions: Mutex::new(Vec::new()),
                loops: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && self.inner.shutdown.is_accepting()
    }

    /// Subscribe to triggers and start the background loops. Idempotent.
    pub fn start(&self) -> Result<(), OrchestratorError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.inner.shutdown.is_accepting() {
            return Err(OrchestratorError::NotRunning);
        }
        let options = SubscriptionOptions::priority(HANDLER_PRIORITY);

        let inner = Arc::clone(&self.inner);
        let on_interaction = self.inner.bus.subscribe_with(
            topics::INTERACTION_RECEIVED,
            options,
            handler_fn(move |event| {
                let inner = Arc::clone(&inner);
                async move {
                    inner.on_interaction(event).await;
                    Ok(())
                }
            }),
        )?;

        let inner = Arc::clone(&self.inner);
        let on_task = self.inner.bus.subscribe_with(
            topics::TASK_DUE,
            options,
            handler_fn(move |event| {
                let inner = Arc::clone(&inner);
                async move {
                    inner.on_task_due(event).await;
                    Ok(())
                }
            }),
        )?;
        self.inner.subscriptions.lock().extend([on_interaction, on_task]);

        let scheduler = tokio::spawn(loops::scheduler(Arc::clone(&self.inner)));
        let maintenance = tokio::spawn(loops::maintenance(Arc::clone(&self.inner)));
        self.inner.loops.lock().extend([scheduler, maintenance]);

        info!(default_model = %self.inner.config.default_model, "Orchestrator started");
        self.inner.bus.publish(
            topics::ORCHESTRATOR_STARTED,
            json!({ "default_model": self.inner.config.default_model }),
        );
        Ok(())
    }

    /// Send a prompt through the bus and wait for its outcome.
    pub async fn request(
        &self,
        prompt: &str,
        model: Option<&str>,
        timeout: Duration,
    ) -> Result<Reply, OrchestratorError> {
        if !self.is_running() {
            return Err(OrchestratorError::NotRunning);
        }
        let correlation_id = Uuid::new_v4();
        let waiter = self.inner.bus.waiter("interaction.*", move |event: &Event| {
            event.correlation_id == Some(correlation_id)
                && (event.topic == topics::INTERACTION_COMPLETED
                    || event.topic == topics::INTERACTION_FAILED)
        })?;

        let mut payload = json!({ "content": prompt });
        if let Some(model) = model {
            payload["model"] = Value::from(model);
        }
        self.inner.bus.publish_event(
            Event::new(topics::INTERACTION_RECEIVED, payload).with_correlation(correlation_id),
        );

        let event = waiter.wait(timeout).await.map_err(|e| match e {
            BusError::Timeout(after) => OrchestratorError::Timeout(after),
            other => OrchestratorError::Bus(other),
        })?;
        if event.topic == topics::INTERACTION_FAILED {
            return Err(OrchestratorError::Failed {
                kind: event.str_field("kind").unwrap_or("unknown").to_string(),
                message: event.str_field("message").unwrap_or_default().to_string(),
            });
        }
        Ok(Reply {
            content: event.str_field("content").unwrap_or_default().to_string(),
            model_id: event.str_field("model_id").unwrap_or_default().to_string(),
            correlation_id,
        })
    }

    /// Stop triggers and loops, wait for running cycles, publish `orchestrator.stopped`.
    pub async fn shutdown(&self) -> ShutdownResult {
        for handle in self.inner.subscriptions.lock().drain(..) {
            self.inner.bus.unsubscribe(handle);
        }
        let result = self.inner.shutdown.initiate(self.inner.config.shutdown_timeout).await;

        let loops: Vec<JoinHandle<()>> = self.inner.loops.lock().drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Orchestrator loop ended abnormally");
            }
        }

        let drained = result == ShutdownResult::Complete;
        if drained {
            info!("Orchestrator stopped");
        } else {
            warn!(?result, "Orchestrator stopped with cycles still running");
        }
        self.inner
            .bus
            .publish(topics::ORCHESTRATOR_STOPPED, json!({ "drained": drained }));
        result
    }
}

impl OrchestratorInner {
    fn emit(&self, topic: &str, payload: Value, correlation_id: Option<Uuid>) {
        let mut event = Event::new(topic, payload);
        event.correlation_id = correlation_id;
        self.bus.publish_event(event);
    }

    async fn on_interaction(&self, event: Arc<Event>) {
        let Some(_guard) = self.shutdown.track() else {
            debug!(event_id = %event.id, "Interaction ignored during shutdown");
            return;
        };
        let cid = event.correlation_id;
        let Some(content) = event.str_field("content").or_else(|| event.str_field("prompt")) else {
            telemetry::record_orchestrator_cycle("invalid");
            self.emit(
                topics::INTERACTION_FAILED,
                json!({ "kind": "invalid_request", "message": "payload has no content" }),
                cid,
            );
            return;
        };
        let role = event
            .str_field("role")
            .and_then(|r| r.parse().ok())
            .unwrap_or(Role::User);
        let model = event
            .str_field("model")
            .unwrap_or(&self.config.default_model)
            .to_string();

        match self.run_cycle("interaction", cid, content, role, &model).await {
            Ok(outcome) => {
                self.emit(
                    topics::INTERACTION_COMPLETED,
                    json!({
                        "content": outcome.response.text,
                        "model_id": outcome.response.model_id,
                        "version": outcome.response.version,
                        "latency_ms": outcome.response.latency_ms,
                        "persisted": outcome.persistence_error.is_none(),
                    }),
                    cid,
                );
                if let Some(e) = outcome.persistence_error {
                    self.report_persistence_failure(&e, cid);
                }
            }
            Err(e) => {
                self.emit(
                    topics::INTERACTION_FAILED,
                    json!({ "kind": e.kind(), "message": e.to_string(), "model_id": model }),
                    cid,
                );
            }
        }
    }

    async fn on_task_due(&self, event: Arc<Event>) {
        let Some(_guard) = self.shutdown.track() else {
            debug!(event_id = %event.id, "Task ignored during shutdown");
            return;
        };
        let cid = event.correlation_id;
        let Some(task_id) = event.str_field("task_id").map(str::to_string) else {
            warn!(event_id = %event.id, "task.due without task_id");
            return;
        };
        let payload = event.payload.get("payload").cloned().unwrap_or(Value::Null);
        let prompt = match &payload {
            Value::String(s) => Some(s.clone()),
            other => other.get("prompt").and_then(Value::as_str).map(str::to_string),
        };
        let model = payload
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&self.config.default_model)
            .to_string();

        let outcome = match prompt {
            Some(prompt) => self
                .run_cycle("task", cid, &prompt, Role::User, &model)
                .await
                .map_err(|e| (e.kind().to_string(), e.to_string())),
            None => Err(("invalid_task".to_string(), "task payload has no prompt".to_string())),
        };

        let (status, topic, body) = match &outcome {
            Ok(done) => (
                TaskStatus::Done,
                topics::TASK_COMPLETED,
                json!({
                    "task_id": task_id,
                    "model_id": done.response.model_id,
                    "content": done.response.text,
                }),
            ),
            Err((kind, message)) => (
                TaskStatus::Failed,
                topics::TASK_FAILED,
                json!({ "task_id": task_id, "kind": kind, "message": message }),
            ),
        };
        if let Err(e) = self.memory.update_task_status(&task_id, status).await {
            warn!(task_id = %task_id, error = %e, "Failed to record task status");
            self.report_persistence_failure(&e, cid);
        }
        self.emit(topic, body, cid);
        if let Ok(CycleOutcome { persistence_error: Some(e), .. }) = outcome {
            self.report_persistence_failure(&e, cid);
        }
    }

    /// Recall, infer, persist. Only inference failure aborts the cycle.
    async fn run_cycle(
        &self,
        trigger: &str,
        correlation_id: Option<Uuid>,
        content: &str,
        role: Role,
        model: &str,
    ) -> Result<CycleOutcome, ModelError> {
        let cid = correlation_id.map(|c| c.to_string()).unwrap_or_default();
        let span = CycleSpan::new(trigger, &cid);
        span.record("model_id", model);
        let result = self
            .cycle(correlation_id, content, role, model)
            .instrument(span.clone())
            .await;
        span.record_result(&result);
        telemetry::record_orchestrator_cycle(match &result {
            Ok(outcome) if outcome.persistence_error.is_some() => "degraded",
            Ok(_) => "ok",
            Err(_) => "failed",
        });
        result
    }

    async fn cycle(
        &self,
        correlation_id: Option<Uuid>,
        content: &str,
        role: Role,
        model: &str,
    ) -> Result<CycleOutcome, ModelError> {
        let history = match self.memory.recent_interactions(self.config.context_interactions).await {
            Ok(history) => history,
            Err(e) => {
                warn!(degraded = true, error = %e, "Context unavailable, continuing without history");
                self.emit(
                    topics::ORCHESTRATOR_DEGRADED,
                    json!({ "reason": "context_unavailable", "error": e.to_string() }),
                    correlation_id,
                );
                Vec::new()
            }
        };

        let prompt = build_prompt(&history, content, role, self.config.context_word_budget);
        let request = InferenceRequest::new(prompt).with_timeout(self.config.inference_timeout);
        let response = self.models.infer(model, request).await?;

        let turn = InteractionRecord::new(role, content);
        let reply = InteractionRecord::new(Role::Assistant, response.text.clone())
            .with_model(response.model_id.clone());
        let persistence_error = self.persist([turn, reply]).await.err();
        Ok(CycleOutcome { response, persistence_error })
    }

    async fn persist(&self, records: [InteractionRecord; 2]) -> Result<(), MemoryError> {
        for record in records {
            let result = self.memory.append_interaction(record).await;
            telemetry::record_memory_write("interactions", result.is_ok());
            result?;
        }
        Ok(())
    }

    fn report_persistence_failure(&self, error: &MemoryError, correlation_id: Option<Uuid>) {
        warn!(degraded = true, error = %error, "Cycle result not persisted");
        self.emit(
            topics::MEMORY_PERSISTENCE_FAILED,
            json!({ "error": error.to_string() }),
            correlation_id,
        );
    }
}

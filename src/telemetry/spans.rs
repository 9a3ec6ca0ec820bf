//! Span helpers for inference calls and orchestration cycles.

use tracing::{info_span, Span};

/// Extension trait for recording an operation's outcome on a span.
pub trait SpanExt {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Span for one `ModelManager::infer` call.
pub struct InferenceSpan;

impl InferenceSpan {
    /// Fields `status`, `error.message` and `latency_ms` are filled in later.
    pub fn new(model_id: &str, version: u64) -> Span {
        info_span!(
            "inference",
            model_id = %model_id,
            version,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}

/// Span for one orchestrator request cycle.
pub struct CycleSpan;

impl CycleSpan {
    pub fn new(trigger: &str, correlation_id: &str) -> Span {
        info_span!(
            "orchestrator_cycle",
            trigger = %trigger,
            correlation_id = %correlation_id,
            model_id = tracing::field::Empty,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}

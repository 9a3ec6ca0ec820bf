//! Telemetry module for the agent runtime.
//!
//! Provides structured logging, request spans, and metrics recording.
//! All output is local (stderr or file); nothing is exported over the network.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    record_event_published, record_handler_failure, record_inference, record_memory_write,
    record_model_load, record_model_swap, record_orchestrator_cycle,
};
pub use spans::{CycleSpan, InferenceSpan, SpanExt};

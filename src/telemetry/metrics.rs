//! Metric recording through the `metrics` facade.
//!
//! No recorder is installed by the runtime itself; embedders choose an
//! exporter. Without one these calls are no-ops.

use metrics::{counter, histogram};

pub fn record_event_published(topic: &str) {
    counter!("hearth_bus_events_published_total", "topic" => topic.to_string()).increment(1);
}

pub fn record_handler_failure(topic: &str) {
    counter!("hearth_bus_handler_failures_total", "topic" => topic.to_string()).increment(1);
}

pub fn record_model_load(format: &str, success: bool, duration_ms: f64) {
    let outcome = if success { "ok" } else { "failed" };
    counter!("hearth_model_loads_total", "format" => format.to_string(), "outcome" => outcome)
        .increment(1);
    if success {
        histogram!("hearth_model_load_ms", "format" => format.to_string()).record(duration_ms);
    }
}

pub fn record_model_swap(model_id: &str) {
    counter!("hearth_model_swaps_total", "model_id" => model_id.to_string()).increment(1);
}

pub fn record_inference(model_id: &str, success: bool, latency_ms: f64) {
    let outcome = if success { "ok" } else { "failed" };
    counter!("hearth_inference_total", "model_id" => model_id.to_string(), "outcome" => outcome)
        .increment(1);
    if success {
        histogram!("hearth_inference_latency_ms", "model_id" => model_id.to_string())
            .record(latency_ms);
    }
}

pub fn record_memory_write(table: &'static str, success: bool) {
    let outcome = if success { "ok" } else { "failed" };
    counter!("hearth_memory_writes_total", "table" => table, "outcome" => outcome).increment(1);
}

pub fn record_orchestrator_cycle(outcome: &'static str) {
    counter!("hearth_orchestrator_cycles_total", "outcome" => outcome).increment(1);
}

//! Integration tests for hot-swap: zero dropped calls, drain, exclusivity.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{descriptor, scripted_manager, ScriptedBackend};
use hearth_agent::bus::{topics, Event};
use hearth_agent::models::{InferenceRequest, InstanceState, ModelError, ModelManagerConfig};

const WAIT: Duration = Duration::from_secs(2);

fn config() -> ModelManagerConfig {
    ModelManagerConfig { inference_timeout: Duration::from_secs(5), ..ModelManagerConfig::default() }
}

#[tokio::test]
async fn test_swap_under_load_drops_nothing() {
    let backend = ScriptedBackend::new(Duration::from_millis(30), Duration::from_millis(40));
    let (manager, _bus, stats) = scripted_manager(config(), backend, &["phi"]);
    let old = manager.load("phi").await.unwrap();

    let mut calls = Vec::new();
    for i in 0..40 {
        let manager = manager.clone();
        calls.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(i * 3)).await;
            manager.infer("phi", InferenceRequest::new(format!("call {}", i))).await
        }));
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    let result = manager.swap("phi", descriptor("phi", "phi-v2.gguf")).await.unwrap();
    assert_eq!(result.old_version, 1);
    assert_eq!(result.new_version, 2);
    assert!(result.in_flight_at_swap > 0, "swap happened while calls were running");

    let mut versions = HashSet::new();
    for call in calls {
        let response = call.await.unwrap().expect("no call may fail across a swap");
        match response.version {
            1 => assert!(response.text.starts_with("phi.gguf:")),
            2 => assert!(response.text.starts_with("phi-v2.gguf:")),
            v => panic!("unexpected version {}", v),
        }
        versions.insert(response.version);
    }
    assert_eq!(versions.len(), 2, "both instances served traffic");

    tokio::time::timeout(WAIT, old.wait_released()).await.unwrap();
    assert_eq!(old.state(), InstanceState::Unloaded);
    assert_eq!(old.in_flight(), 0);
    assert_eq!(stats.unloads(), 1);

    let after = manager.infer("phi", InferenceRequest::new("after")).await.unwrap();
    assert_eq!(after.version, 2);
    assert_eq!(manager.descriptor("phi").unwrap().path.file_name().unwrap(), "phi-v2.gguf");
}

#[tokio::test]
async fn test_failed_swap_keeps_old_instance() {
    let backend = ScriptedBackend::new(Duration::ZERO, Duration::ZERO);
    let (manager, bus, _) = scripted_manager(config(), backend, &["phi"]);
    let old = manager.load("phi").await.unwrap();
    let failed = bus
        .waiter(topics::MODEL_FAILED, |e: &Event| e.payload["swap"] == true)
        .unwrap();

    let err = manager.swap("phi", descriptor("phi", "broken.gguf")).await.unwrap_err();
    assert!(matches!(err, ModelError::Load { .. }));
    failed.wait(WAIT).await.unwrap();

    let current = manager.current("phi").unwrap();
    assert!(Arc::ptr_eq(&current, &old));
    assert!(old.is_ready());
    assert_eq!(manager.state("phi"), InstanceState::Ready);
    let response = manager.infer("phi", InferenceRequest::new("still here")).await.unwrap();
    assert_eq!(response.version, old.version());
}

#[tokio::test]
async fn test_concurrent_swap_rejected() {
    let backend = ScriptedBackend::new(Duration::from_millis(150), Duration::ZERO);
    let (manager, _bus, _) = scripted_manager(config(), backend, &["phi"]);
    manager.load("phi").await.unwrap();

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.swap("phi", descriptor("phi", "phi-v2.gguf")).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(matches!(
        manager.swap("phi", descriptor("phi", "phi-v3.gguf")).await,
        Err(ModelError::SwapInProgress(_))
    ));
    assert!(matches!(manager.unload("phi").await, Err(ModelError::SwapInProgress(_))));

    let result = first.await.unwrap().unwrap();
    assert_eq!(result.new_version, 2);

    // The permit is released once the swap returns.
    let second = manager.swap("phi", descriptor("phi", "phi-v3.gguf")).await.unwrap();
    assert_eq!(second.old_version, 2);
    assert_eq!(second.new_version, 3);
}

#[tokio::test]
async fn test_swap_requires_loaded_model() {
    let backend = ScriptedBackend::new(Duration::ZERO, Duration::ZERO);
    let (manager, _bus, stats) = scripted_manager(config(), backend, &["phi"]);
    assert!(matches!(
        manager.swap("phi", descriptor("phi", "phi-v2.gguf")).await,
        Err(ModelError::NotLoaded(_))
    ));
    assert_eq!(stats.loads(), 0);
}

#[tokio::test]
async fn test_swap_events_report_versions() {
    let backend = ScriptedBackend::new(Duration::ZERO, Duration::from_millis(50));
    let (manager, bus, _) = scripted_manager(config(), backend, &["phi"]);
    manager.load("phi").await.unwrap();

    let swapped = bus.waiter(topics::MODEL_SWAPPED, |_| true).unwrap();
    let unloaded = bus
        .waiter(topics::MODEL_UNLOADED, |e: &Event| e.str_field("reason") == Some("swapped"))
        .unwrap();

    let call = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.infer("phi", InferenceRequest::new("hold")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let result = manager.swap("phi", descriptor("phi", "phi-v2.gguf")).await.unwrap();
    assert_eq!(result.in_flight_at_swap, 1);

    let event = swapped.wait(WAIT).await.unwrap();
    assert_eq!(event.payload["old_version"], 1);
    assert_eq!(event.payload["new_version"], 2);
    assert_eq!(event.payload["in_flight"], 1);

    // The superseded instance is released only after the held call returns.
    let event = unloaded.wait(WAIT).await.unwrap();
    assert_eq!(event.payload["version"], 1);
    assert_eq!(call.await.unwrap().unwrap().version, 1);
}

//! Discovery against real directories: confinement, sidecars, hashing.

mod common;

use common::{gguf_bytes, write_gguf};
use hearth_agent::bus::EventBus;
use hearth_agent::models::{
    sha256_file, BackendRegistry, InferenceRequest, ModelCapability, ModelManager,
    ModelManagerConfig, ModelScanner,
};

#[test]
fn test_sidecar_overrides_id_and_capabilities() {
    let root = tempfile::tempdir().unwrap();
    write_gguf(root.path(), "llama-3-8b-q4.gguf");
    std::fs::write(
        root.path().join("llama-3-8b-q4.manifest.json"),
        r#"{"model_id": "assistant", "capabilities": ["chat"], "parameters": {"context_length": 8192}}"#,
    )
    .unwrap();

    let found = ModelScanner::new(root.path()).scan().unwrap();
    assert_eq!(found.len(), 1);
    let d = &found[0];
    assert_eq!(d.id, "assistant");
    assert_eq!(d.capabilities, vec![ModelCapability::Chat]);
    assert_eq!(d.parameter_u64("context_length"), Some(8192));
    assert_eq!(d.size_bytes, gguf_bytes().len() as u64);
}

#[test]
fn test_invalid_sidecar_skips_only_that_artifact() {
    let root = tempfile::tempdir().unwrap();
    write_gguf(root.path(), "good.gguf");
    write_gguf(root.path(), "bad.gguf");
    std::fs::write(root.path().join("bad.manifest.json"), r#"{"surprise": true}"#).unwrap();

    let ids: Vec<String> = ModelScanner::new(root.path())
        .scan()
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(ids, vec!["good".to_string()]);
}

#[test]
fn test_hash_verification() {
    let root = tempfile::tempdir().unwrap();
    let good = write_gguf(root.path(), "good.gguf");
    write_gguf(root.path(), "tampered.gguf");
    let digest = sha256_file(&good).unwrap();
    std::fs::write(
        root.path().join("good.manifest.json"),
        format!(r#"{{"sha256": "{}"}}"#, digest.to_uppercase()),
    )
    .unwrap();
    std::fs::write(
        root.path().join("tampered.manifest.json"),
        format!(r#"{{"sha256": "{}"}}"#, "0".repeat(64)),
    )
    .unwrap();

    // Without hashing, declared hashes are carried but not checked.
    let unchecked = ModelScanner::new(root.path()).scan().unwrap();
    assert_eq!(unchecked.len(), 2);

    let checked = ModelScanner::new(root.path()).with_hashing(true).scan().unwrap();
    assert_eq!(checked.len(), 1);
    assert_eq!(checked[0].id, "good");
    assert_eq!(checked[0].sha256.as_deref(), Some(digest.as_str()));
}

#[cfg(unix)]
#[test]
fn test_symlink_outside_root_rejected() {
    let outside = tempfile::tempdir().unwrap();
    let target = write_gguf(outside.path(), "elsewhere.gguf");
    let root = tempfile::tempdir().unwrap();
    std::os::unix::fs::symlink(&target, root.path().join("escape.gguf")).unwrap();
    write_gguf(root.path(), "local.gguf");

    let ids: Vec<String> = ModelScanner::new(root.path())
        .scan()
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(ids, vec!["local".to_string()]);
}

#[tokio::test]
async fn test_rediscover_then_swap_to_new_artifact() {
    let root = tempfile::tempdir().unwrap();
    write_gguf(root.path(), "chat.gguf");
    let config = ModelManagerConfig { models_dir: root.path().to_path_buf(), ..Default::default() };
    let manager = ModelManager::new(config, EventBus::new(), BackendRegistry::with_defaults());
    manager.discover().await.unwrap();
    manager.load("chat").await.unwrap();

    // A newer artifact lands next to the old one.
    write_gguf(root.path(), "chat-v2.gguf");
    let found = manager.discover().await.unwrap();
    let replacement = found.into_iter().find(|d| d.id == "chat-v2").unwrap();

    let result = manager.swap("chat", replacement).await.unwrap();
    assert_eq!(result.new_version, 2);
    let response = manager.infer("chat", InferenceRequest::new("User: hi")).await.unwrap();
    assert_eq!(response.version, 2);
    // The swapped descriptor keeps the logical id.
    assert_eq!(manager.descriptor("chat").unwrap().id, "chat");
    assert!(manager.descriptor("chat").unwrap().path.ends_with("chat-v2.gguf"));

    manager.shutdown().await;
}

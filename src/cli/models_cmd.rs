//! Models CLI subcommands: list, check.
//!
//! Both scan the configured models directory directly; no runtime is started.

use crate::bus::EventBus;
use crate::config::Config;
use crate::models::{BackendRegistry, InferenceRequest, ModelDescriptor, ModelManager};

use super::{EXIT_FAILURE, EXIT_RUNTIME, EXIT_SUCCESS};

fn manager(config: &Config) -> ModelManager {
    ModelManager::new(config.models.clone(), EventBus::new(), BackendRegistry::with_defaults())
}

/// Run `models list`.
///
/// Returns 0 on success, 3 if the models directory cannot be scanned.
pub async fn run_list(config: &Config, json: bool) -> i32 {
    let manager = manager(config);
    // Discovered artifacts plus the built-in model.
    let descriptors = match manager.discover().await {
        Ok(_) => manager.descriptors(),
        Err(e) => {
            eprintln!("Model discovery failed: {}", e);
            eprintln!("Check HEARTH_MODELS_DIR ({}).", config.models.models_dir.display());
            return EXIT_RUNTIME;
        }
    };

    if json {
        return match serde_json::to_string_pretty(&descriptors) {
            Ok(text) => {
                println!("{}", text);
                EXIT_SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to serialize descriptors: {}", e);
                EXIT_FAILURE
            }
        };
    }
    print_models(&descriptors);
    EXIT_SUCCESS
}

/// Run `models check <id>`: load the artifact and run one short inference.
///
/// Returns 0 if the model loads and answers, 1 otherwise.
pub async fn run_check(config: &Config, id: &str) -> i32 {
    let manager = manager(config);
    if let Err(e) = manager.discover().await {
        eprintln!("Model discovery failed: {}", e);
        return EXIT_RUNTIME;
    }

    let code = match manager.load(id).await {
        Ok(instance) => {
            let request = InferenceRequest::new("ping").with_max_tokens(4);
            match manager.infer(id, request).await {
                Ok(response) => {
                    println!(
                        "{} v{} ({}): ok, {} token(s) in {} ms",
                        id,
                        instance.version(),
                        instance.descriptor().format,
                        response.tokens,
                        response.latency_ms
                    );
                    EXIT_SUCCESS
                }
                Err(e) => {
                    eprintln!("{}: inference failed: {}", id, e);
                    EXIT_FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("{}: {}", id, e);
            EXIT_FAILURE
        }
    };
    manager.shutdown().await;
    code
}

/// Format and print descriptors to stdout.
pub fn print_models(descriptors: &[ModelDescriptor]) {
    if descriptors.is_empty() {
        println!("No models discovered.");
        return;
    }

    println!(
        "{:<30} {:<8} {:>12} {:<34}",
        "NAME", "FORMAT", "SIZE (MB)", "CAPABILITIES"
    );
    println!("{}", "-".repeat(86));

    let mut total_bytes = 0u64;
    for d in descriptors {
        total_bytes += d.size_bytes;
        let caps: Vec<String> = d
            .capabilities
            .iter()
            .map(|c| format!("{:?}", c).to_lowercase())
            .collect();
        println!(
            "{:<30} {:<8} {:>12} {:<34}",
            truncate(&d.id, 29),
            d.format.as_str(),
            d.size_bytes / (1024 * 1024),
            caps.join(","),
        );
    }

    println!("{}", "-".repeat(86));
    println!(
        "Total size: {} MB  |  {} model(s) available",
        total_bytes / (1024 * 1024),
        descriptors.len()
    );
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

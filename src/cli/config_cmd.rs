//! Config CLI subcommands: show, defaults, validate.
//!
//! These commands only read configuration; nothing is started.

use crate::config::{Config, EffectiveConfig};
use crate::runtime::validate_components;

use super::{EXIT_FAILURE, EXIT_SUCCESS};

/// Print the effective config, as key-value pairs or JSON.
pub fn run_show(config: &Config, json: bool) -> i32 {
    print_effective(&config.effective_config(), json)
}

/// Print built-in defaults, ignoring the config file and environment.
pub fn run_defaults(json: bool) -> i32 {
    print_effective(&Config::default().effective_config(), json)
}

/// Check for misconfigurations that startup would reject or regret.
///
/// Returns 0 if valid, 1 if any problem is found.
pub fn run_validate(config: &Config) -> i32 {
    let mut problems = 0;

    if let Err(e) = validate_components(config) {
        eprintln!("ERROR: {}", e);
        problems += 1;
    }
    if !config.models.models_dir.is_dir() {
        eprintln!(
            "WARNING: models directory {} does not exist; no models will be discovered",
            config.models.models_dir.display()
        );
        problems += 1;
    }
    if config.orchestrator.retention < config.orchestrator.prune_interval {
        eprintln!(
            "WARNING: retention ({}s) is shorter than the prune interval ({}s)",
            config.orchestrator.retention.as_secs(),
            config.orchestrator.prune_interval.as_secs()
        );
        problems += 1;
    }

    if problems == 0 {
        println!("Configuration is valid.");
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    }
}

fn print_effective(cfg: &EffectiveConfig, json: bool) -> i32 {
    if json {
        return match serde_json::to_string_pretty(cfg) {
            Ok(text) => {
                println!("{}", text);
                EXIT_SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to serialize config: {}", e);
                EXIT_FAILURE
            }
        };
    }
    for line in render_lines(cfg) {
        println!("{}", line);
    }
    EXIT_SUCCESS
}

fn render_lines(cfg: &EffectiveConfig) -> Vec<String> {
    let optional = |p: &Option<std::path::PathBuf>| {
        p.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
    };
    let mut lines = vec![
        format!("HEARTH_CONFIG={}", optional(&cfg.config_file)),
        format!("HEARTH_DATA_DIR={}", cfg.data_dir.display()),
        format!("HEARTH_MEMORY_DB={}", cfg.memory_path.display()),
        format!("HEARTH_MODELS_DIR={}", cfg.models_dir.display()),
        format!("HEARTH_DEFAULT_MODEL={}", cfg.default_model),
        format!("HEARTH_AUTO_LOAD={}", cfg.auto_load),
        format!("HEARTH_VERIFY_HASHES={}", cfg.verify_hashes),
        format!("HEARTH_INFERENCE_TIMEOUT_MS={}", cfg.inference_timeout_ms),
        format!("HEARTH_CONTEXT_INTERACTIONS={}", cfg.context_interactions),
        format!("HEARTH_CONTEXT_WORDS={}", cfg.context_words),
        format!("HEARTH_TASK_POLL_MS={}", cfg.task_poll_ms),
        format!("HEARTH_PRUNE_INTERVAL_SECS={}", cfg.prune_interval_secs),
        format!("HEARTH_RETENTION_SECS={}", cfg.retention_secs),
        format!("HEARTH_SHUTDOWN_TIMEOUT={}", cfg.shutdown_timeout_secs),
        format!("HEARTH_LOG_FORMAT={}", cfg.log_format),
        format!("HEARTH_LOG_LEVEL={}", cfg.log_level),
        format!("HEARTH_LOG_FILE={}", optional(&cfg.log_file)),
    ];
    for (component, entry) in &cfg.components {
        lines.push(format!("components.{}.scope={:?}", component, entry.scope).to_lowercase());
    }
    lines
}

//! Runtime configuration.
//!
//! Values come from built-in defaults, then an optional TOML file named by
//! `HEARTH_CONFIG`, then `HEARTH_*` environment variables. Invalid env values
//! fall back to the layer below without crashing; floors are applied last.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `HEARTH_CONFIG` | unset | Path of a TOML config file |
//! | `HEARTH_DATA_DIR` | `data` | Directory for durable state |
//! | `HEARTH_MEMORY_DB` | `<data dir>/memory.db` | SQLite memory database |
//! | `HEARTH_MODELS_DIR` | `models` | Model discovery root |
//! | `HEARTH_DEFAULT_MODEL` | `default` | Model used when a request names none |
//! | `HEARTH_AUTO_LOAD` | false | Load models on first inference |
//! | `HEARTH_VERIFY_HASHES` | false | SHA-256 every artifact during discovery |
//! | `HEARTH_INFERENCE_TIMEOUT_MS` | 30000 | Caller wait limit per inference |
//! | `HEARTH_CONTEXT_INTERACTIONS` | 10 | Past interactions recalled per cycle |
//! | `HEARTH_CONTEXT_WORDS` | 1024 | Word budget for recalled history |
//! | `HEARTH_TASK_POLL_MS` | 30000 | Due-task polling period |
//! | `HEARTH_PRUNE_INTERVAL_SECS` | 600 | Memory maintenance period |
//! | `HEARTH_RETENTION_SECS` | 86400 | Age at which memory is pruned |
//! | `HEARTH_SHUTDOWN_TIMEOUT` | 10 | Graceful shutdown timeout (secs) |
//! | `HEARTH_LOG_FORMAT` | `json` | `json` or `pretty` |
//! | `HEARTH_LOG_LEVEL` | `info` | Tracing filter directive |
//! | `HEARTH_LOG_FILE` | unset | Append logs to this file instead of stderr |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::container::Scope;
use crate::models::ModelManagerConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::telemetry::{LogConfig, LogFormat};

pub const CONFIG_ENV: &str = "HEARTH_CONFIG";

const MIN_INFERENCE_TIMEOUT_MS: u64 = 10;
const MIN_TASK_POLL_MS: u64 = 50;
const MIN_CONTEXT_WORDS: usize = 16;
const MIN_RETENTION_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Scope override for one component key from the `[components]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentConfig {
    pub scope: Scope,
}

/// TOML file layout. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub models: ModelsSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSection {
    pub data_dir: Option<PathBuf>,
    pub memory_db: Option<PathBuf>,
    pub shutdown_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelsSection {
    pub dir: Option<PathBuf>,
    pub default: Option<String>,
    pub auto_load: Option<bool>,
    pub verify_hashes: Option<bool>,
    pub inference_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorSection {
    pub context_interactions: Option<usize>,
    pub context_words: Option<usize>,
    pub task_poll_ms: Option<u64>,
    pub prune_interval_secs: Option<u64>,
    pub retention_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    pub format: Option<String>,
    pub level: Option<String>,
    pub file: Option<PathBuf>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub config_file: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub memory_path: PathBuf,
    pub shutdown_timeout: Duration,
    pub models: ModelManagerConfig,
    pub orchestrator: OrchestratorConfig,
    pub logging: LogConfig,
    pub components: BTreeMap<String, ComponentConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("data");
        let shutdown_timeout = Duration::from_secs(10);
        let models = ModelManagerConfig::default();
        let orchestrator = OrchestratorConfig {
            inference_timeout: models.inference_timeout,
            shutdown_timeout,
            ..OrchestratorConfig::default()
        };
        Self {
            config_file: None,
            memory_path: data_dir.join("memory.db"),
            data_dir,
            shutdown_timeout,
            models,
            orchestrator,
            logging: LogConfig::default(),
            components: BTreeMap::new(),
        }
    }
}

/// Read an env var and parse it. Missing or unparseable yields None.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Booleans accept `1/0`, `true/false`, `yes/no`, `on/off`.
fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Load configuration: defaults, then the `HEARTH_CONFIG` file, then env.
pub fn load() -> Result<Config, ConfigError> {
    let file = match env_string(CONFIG_ENV) {
        Some(path) => {
            let path = PathBuf::from(path);
            Some((FileConfig::from_file(&path)?, path))
        }
        None => None,
    };
    Ok(resolve(file))
}

/// Layer `file` and the environment over the defaults.
pub fn resolve(file: Option<(FileConfig, PathBuf)>) -> Config {
    let mut cfg = Config::default();
    let mut memory_db: Option<PathBuf> = None;
    let mut shutdown_secs = cfg.shutdown_timeout.as_secs();
    let mut inference_ms = cfg.models.inference_timeout.as_millis() as u64;
    let mut task_poll_ms = cfg.orchestrator.task_poll_interval.as_millis() as u64;
    let mut prune_secs = cfg.orchestrator.prune_interval.as_secs();
    let mut retention_secs = cfg.orchestrator.retention.as_secs();

    if let Some((file, path)) = file {
        cfg.config_file = Some(path);
        let FileConfig { runtime, models, orchestrator, logging, components } = file;

        if let Some(dir) = runtime.data_dir {
            cfg.data_dir = dir;
        }
        memory_db = runtime.memory_db;
        shutdown_secs = runtime.shutdown_timeout_secs.unwrap_or(shutdown_secs);

        if let Some(dir) = models.dir {
            cfg.models.models_dir = dir;
        }
        if let Some(default) = models.default {
            cfg.orchestrator.default_model = default;
        }
        cfg.models.auto_load = models.auto_load.unwrap_or(cfg.models.auto_load);
        cfg.models.verify_hashes = models.verify_hashes.unwrap_or(cfg.models.verify_hashes);
        inference_ms = models.inference_timeout_ms.unwrap_or(inference_ms);

        cfg.orchestrator.context_interactions = orchestrator
            .context_interactions
            .unwrap_or(cfg.orchestrator.context_interactions);
        cfg.orchestrator.context_word_budget = orchestrator
            .context_words
            .unwrap_or(cfg.orchestrator.context_word_budget);
        task_poll_ms = orchestrator.task_poll_ms.unwrap_or(task_poll_ms);
        prune_secs = orchestrator.prune_interval_secs.unwrap_or(prune_secs);
        retention_secs = orchestrator.retention_secs.unwrap_or(retention_secs);

        if let Some(format) = logging.format.and_then(|f| f.parse::<LogFormat>().ok()) {
            cfg.logging.format = format;
        }
        if let Some(level) = logging.level {
            cfg.logging.level = level;
        }
        cfg.logging.output_path = logging.file;
        cfg.components = components;
    }

    if let Some(dir) = env_string("HEARTH_DATA_DIR") {
        cfg.data_dir = PathBuf::from(dir);
    }
    if let Some(db) = env_string("HEARTH_MEMORY_DB") {
        memory_db = Some(PathBuf::from(db));
    }
    if let Some(dir) = env_string("HEARTH_MODELS_DIR") {
        cfg.models.models_dir = PathBuf::from(dir);
    }
    if let Some(model) = env_string("HEARTH_DEFAULT_MODEL") {
        cfg.orchestrator.default_model = model;
    }
    cfg.models.auto_load = env_bool("HEARTH_AUTO_LOAD").unwrap_or(cfg.models.auto_load);
    cfg.models.verify_hashes = env_bool("HEARTH_VERIFY_HASHES").unwrap_or(cfg.models.verify_hashes);
    inference_ms = env_parse("HEARTH_INFERENCE_TIMEOUT_MS").unwrap_or(inference_ms);
    cfg.orchestrator.context_interactions =
        env_parse("HEARTH_CONTEXT_INTERACTIONS").unwrap_or(cfg.orchestrator.context_interactions);
    cfg.orchestrator.context_word_budget =
        env_parse("HEARTH_CONTEXT_WORDS").unwrap_or(cfg.orchestrator.context_word_budget);
    task_poll_ms = env_parse("HEARTH_TASK_POLL_MS").unwrap_or(task_poll_ms);
    prune_secs = env_parse("HEARTH_PRUNE_INTERVAL_SECS").unwrap_or(prune_secs);
    retention_secs = env_parse("HEARTH_RETENTION_SECS").unwrap_or(retention_secs);
    shutdown_secs = env_parse("HEARTH_SHUTDOWN_TIMEOUT").unwrap_or(shutdown_secs);
    if let Some(format) = env_parse::<LogFormat>("HEARTH_LOG_FORMAT") {
        cfg.logging.format = format;
    }
    if let Some(level) = env_string("HEARTH_LOG_LEVEL") {
        cfg.logging.level = level;
    }
    if let Some(file) = env_string("HEARTH_LOG_FILE") {
        cfg.logging.output_path = Some(PathBuf::from(file));
    }

    // Floors: zero periods would spin or panic in interval timers.
    let inference_ms = inference_ms.max(MIN_INFERENCE_TIMEOUT_MS);
    let task_poll_ms = task_poll_ms.max(MIN_TASK_POLL_MS);
    let prune_secs = prune_secs.max(1);
    let retention_secs = retention_secs.max(MIN_RETENTION_SECS);
    let shutdown_secs = shutdown_secs.max(1);
    cfg.orchestrator.context_word_budget = cfg.orchestrator.context_word_budget.max(MIN_CONTEXT_WORDS);

    cfg.memory_path = memory_db.unwrap_or_else(|| cfg.data_dir.join("memory.db"));
    cfg.shutdown_timeout = Duration::from_secs(shutdown_secs);
    cfg.models.inference_timeout = Duration::from_millis(inference_ms);
    cfg.orchestrator.inference_timeout = cfg.models.inference_timeout;
    cfg.orchestrator.shutdown_timeout = cfg.shutdown_timeout;
    cfg.orchestrator.task_poll_interval = Duration::from_millis(task_poll_ms);
    cfg.orchestrator.prune_interval = Duration::from_secs(prune_secs);
    cfg.orchestrator.retention = Duration::from_secs(retention_secs);
    cfg
}

/// Effective configuration summary, as printed by `config show`.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub config_file: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub memory_path: PathBuf,
    pub models_dir: PathBuf,
    pub default_model: String,
    pub auto_load: bool,
    pub verify_hashes: bool,
    pub inference_timeout_ms: u64,
    pub context_interactions: usize,
    pub context_words: usize,
    pub task_poll_ms: u64,
    pub prune_interval_secs: u64,
    pub retention_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub log_format: String,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub components: BTreeMap<String, ComponentConfig>,
}

impl Config {
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            config_file: self.config_file.clone(),
            data_dir: self.data_dir.clone(),
            memory_path: self.memory_path.clone(),
            models_dir: self.models.models_dir.clone(),
            default_model: self.orchestrator.default_model.clone(),
            auto_load: self.models.auto_load,
            verify_hashes: self.models.verify_hashes,
            inference_timeout_ms: self.models.inference_timeout.as_millis() as u64,
            context_interactions: self.orchestrator.context_interactions,
            context_words: self.orchestrator.context_word_budget,
            task_poll_ms: self.orchestrator.task_poll_interval.as_millis() as u64,
            prune_interval_secs: self.orchestrator.prune_interval.as_secs(),
            retention_secs: self.orchestrator.retention.as_secs(),
            shutdown_timeout_secs: self.shutdown_timeout.as_secs(),
            log_format: match self.logging.format {
                LogFormat::Json => "json".to_string(),
                LogFormat::Pretty => "pretty".to_string(),
            },
            log_level: self.logging.level.clone(),
            log_file: self.logging.output_path.clone(),
            components: self.components.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "HEARTH_CONFIG",
        "HEARTH_DATA_DIR",
        "HEARTH_MEMORY_DB",
        "HEARTH_MODELS_DIR",
        "HEARTH_DEFAULT_MODEL",
        "HEARTH_AUTO_LOAD",
        "HEARTH_VERIFY_HASHES",
        "HEARTH_INFERENCE_TIMEOUT_MS",
        "HEARTH_CONTEXT_INTERACTIONS",
        "HEARTH_CONTEXT_WORDS",
        "HEARTH_TASK_POLL_MS",
        "HEARTH_PRUNE_INTERVAL_SECS",
        "HEARTH_RETENTION_SECS",
        "HEARTH_SHUTDOWN_TIMEOUT",
        "HEARTH_LOG_FORMAT",
        "HEARTH_LOG_LEVEL",
        "HEARTH_LOG_FILE",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load().unwrap();
        assert!(cfg.config_file.is_none());
        assert_eq!(cfg.memory_path, PathBuf::from("data").join("memory.db"));
        assert_eq!(cfg.models.models_dir, PathBuf::from("models"));
        assert!(!cfg.models.auto_load);
        assert_eq!(cfg.models.inference_timeout, Duration::from_secs(30));
        assert_eq!(cfg.orchestrator.default_model, "default");
        assert_eq!(cfg.orchestrator.context_interactions, 10);
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("HEARTH_DATA_DIR", "/var/lib/hearth");
        std::env::set_var("HEARTH_AUTO_LOAD", "yes");
        std::env::set_var("HEARTH_INFERENCE_TIMEOUT_MS", "1500");
        std::env::set_var("HEARTH_LOG_FORMAT", "pretty");
        let cfg = load().unwrap();
        clear_env_vars();

        assert_eq!(cfg.memory_path, PathBuf::from("/var/lib/hearth/memory.db"));
        assert!(cfg.models.auto_load);
        assert_eq!(cfg.models.inference_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.orchestrator.inference_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("HEARTH_CONTEXT_INTERACTIONS", "many");
        std::env::set_var("HEARTH_AUTO_LOAD", "maybe");
        std::env::set_var("HEARTH_LOG_FORMAT", "xml");
        let cfg = load().unwrap();
        clear_env_vars();

        assert_eq!(cfg.orchestrator.context_interactions, 10);
        assert!(!cfg.models.auto_load);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_floors_applied() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("HEARTH_TASK_POLL_MS", "0");
        std::env::set_var("HEARTH_SHUTDOWN_TIMEOUT", "0");
        std::env::set_var("HEARTH_INFERENCE_TIMEOUT_MS", "0");
        let cfg = load().unwrap();
        clear_env_vars();

        assert_eq!(cfg.orchestrator.task_poll_interval, Duration::from_millis(MIN_TASK_POLL_MS));
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(
            cfg.models.inference_timeout,
            Duration::from_millis(MIN_INFERENCE_TIMEOUT_MS)
        );
    }

    #[test]
    fn test_file_then_env_precedence() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearth.toml");
        std::fs::write(
            &path,
            r#"
[models]
dir = "/srv/models"
default = "phi"

[orchestrator]
context_interactions = 4

[components.memory]
scope = "singleton"
"#,
        )
        .unwrap();
        std::env::set_var("HEARTH_CONFIG", &path);
        std::env::set_var("HEARTH_DEFAULT_MODEL", "llama");
        let cfg = load().unwrap();
        clear_env_vars();

        assert_eq!(cfg.config_file.as_deref(), Some(path.as_path()));
        assert_eq!(cfg.models.models_dir, PathBuf::from("/srv/models"));
        assert_eq!(cfg.orchestrator.default_model, "llama");
        assert_eq!(cfg.orchestrator.context_interactions, 4);
        assert_eq!(cfg.components["memory"].scope, Scope::Singleton);
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[models]\ndirr = 1\n").unwrap();
        std::env::set_var("HEARTH_CONFIG", &path);
        let result = load();
        clear_env_vars();
        assert!(matches!(result, Err(ConfigError::Parse { .. })));

        std::env::set_var("HEARTH_CONFIG", dir.path().join("missing.toml"));
        let result = load();
        clear_env_vars();
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_effective_config_serializes() {
        let cfg = resolve(None);
        let summary = serde_json::to_value(cfg.effective_config()).unwrap();
        assert!(summary.get("models_dir").is_some());
        assert!(summary.get("task_poll_ms").is_some());
    }
}

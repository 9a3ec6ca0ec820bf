//! CLI subcommands for the agent runtime.
//!
//! ```bash
//! hearth-agent chat              # interactive session over the orchestrator
//! hearth-agent models list       # discover and list model artifacts
//! hearth-agent config show       # print the effective configuration
//! ```

pub mod chat;
pub mod config_cmd;
pub mod models_cmd;

pub use chat::run_chat;

/// Process exit codes.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_RUNTIME: i32 = 3;

/// Value following `--name` in `args`, if present.
pub fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

pub fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_flag_value() {
        let a = args(&["chat", "--model", "phi", "--json"]);
        assert_eq!(flag_value(&a, "--model"), Some("phi"));
        assert_eq!(flag_value(&a, "--json"), None);
        assert_eq!(flag_value(&a, "--prompt"), None);
    }

    #[test]
    fn test_has_flag() {
        let a = args(&["models", "list", "--json"]);
        assert!(has_flag(&a, "--json"));
        assert!(!has_flag(&a, "--verbose"));
    }
}

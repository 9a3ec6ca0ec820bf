//! Hearthlink agent entry point.
//!
//! ## CLI Subcommands
//!
//! - `hearth-agent` or `hearth-agent chat` - Interactive session (default)
//! - `hearth-agent models list|check` - Inspect model artifacts
//! - `hearth-agent config show|defaults|validate` - Inspect configuration

use std::process::ExitCode;

use hearth_agent::cli::{self, config_cmd, flag_value, has_flag, models_cmd};
use hearth_agent::config::{self, Config};
use hearth_agent::telemetry::init_logging;

fn exit(code: i32) -> ExitCode {
    ExitCode::from(code as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("chat");

    match command {
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            return ExitCode::SUCCESS;
        }
        "version" | "--version" | "-V" => {
            println!("hearth-agent {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        _ => {}
    }

    let config = match load_config() {
        Some(config) => config,
        None => return exit(cli::EXIT_CONFIG),
    };
    let json = has_flag(&args, "--json");

    match command {
        "chat" | "" => {
            if let Err(e) = init_logging(&config.logging) {
                eprintln!("Logging setup failed: {}", e);
                return exit(cli::EXIT_CONFIG);
            }
            let model = flag_value(&args, "--model").map(str::to_string);
            let prompt = flag_value(&args, "--prompt").map(str::to_string);
            exit(cli::run_chat(config, model, prompt).await)
        }
        "models" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("list");
            match subcommand {
                "list" | "--json" => exit(models_cmd::run_list(&config, json).await),
                "check" => match args.get(3) {
                    Some(id) => exit(models_cmd::run_check(&config, id).await),
                    None => {
                        eprintln!("models check requires a model id");
                        print_command_help("models");
                        ExitCode::FAILURE
                    }
                },
                _ => {
                    eprintln!("Unknown models subcommand: {}", subcommand);
                    print_command_help("models");
                    ExitCode::FAILURE
                }
            }
        }
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" | "--json" => exit(config_cmd::run_show(&config, json)),
                "defaults" => exit(config_cmd::run_defaults(json)),
                "validate" => exit(config_cmd::run_validate(&config)),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> Option<Config> {
    match config::load() {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            None
        }
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "hearth-agent - local agent runtime v{}

USAGE:
    hearth-agent [COMMAND] [OPTIONS]

COMMANDS:
    chat         Interactive session over the orchestrator (default)
    models       Inspect model artifacts (list, check)
    config       Inspect configuration (show, defaults, validate)
    version      Show version information
    help         Show this help message

OPTIONS:
    -h, --help     Show help for command
    -V, --version  Show version information
    --json         JSON output for models and config

EXAMPLES:
    hearth-agent                                 # Chat with the default model
    hearth-agent chat --model phi-3              # Chat with a specific model
    hearth-agent chat --prompt \"Hello\"           # Answer once and exit
    hearth-agent models list                     # List discovered models
    hearth-agent models check phi-3              # Load and probe one model
    hearth-agent config show --json              # Effective configuration

ENVIRONMENT:
    HEARTH_CONFIG        TOML config file
    HEARTH_DATA_DIR      Data directory (default: data)
    HEARTH_MODELS_DIR    Models root (default: models)
    HEARTH_DEFAULT_MODEL Model used when a request names none
    HEARTH_LOG_LEVEL     Log filter (debug, info, warn, error)

EXIT CODES:
    0  Success
    1  Failure
    2  Configuration error
    3  Runtime error
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "chat" => {
            eprintln!(
                "hearth-agent chat - Interactive session

USAGE:
    hearth-agent chat [--model ID] [--prompt TEXT]

OPTIONS:
    --model ID     Model to use (default: HEARTH_DEFAULT_MODEL)
    --prompt TEXT  Send one prompt, print the reply and exit

DESCRIPTION:
    Builds the runtime, discovers models, loads the chosen one and reads
    prompts from stdin. Every exchange is stored in memory and becomes
    context for the next one. /models lists model states, /quit exits.
"
            );
        }
        "models" => {
            eprintln!(
                "hearth-agent models - Inspect model artifacts

USAGE:
    hearth-agent models list [--json]
    hearth-agent models check ID

DESCRIPTION:
    list   Scan the models directory and print every recognized artifact.
    check  Load one model and run a short probe inference.
"
            );
        }
        "config" => {
            eprintln!(
                "hearth-agent config - Inspect configuration

USAGE:
    hearth-agent config show [--json]
    hearth-agent config defaults [--json]
    hearth-agent config validate

DESCRIPTION:
    show      Effective values after file and environment overrides.
    defaults  Built-in values.
    validate  Report settings startup would reject or that look wrong.
"
            );
        }
        _ => {
            eprintln!("No detailed help for '{}'.", command);
            print_usage();
        }
    }
}

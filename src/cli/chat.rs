//! Interactive chat over the orchestrator.
//!
//! Each line read from stdin goes through `Orchestrator::request`, so it takes
//! the same bus path, context assembly and persistence as any other
//! interaction.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

use crate::config::Config;
use crate::runtime::Runtime;
use crate::shutdown::ShutdownResult;

use super::{EXIT_FAILURE, EXIT_RUNTIME, EXIT_SUCCESS};

/// Extra wait on top of the inference timeout for the bus round trip.
const REQUEST_MARGIN: Duration = Duration::from_secs(2);

/// REPL commands, recognized before anything is sent to a model.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Quit,
    Models,
    Prompt(&'a str),
}

fn classify(line: &str) -> Input<'_> {
    match line.trim() {
        "" => Input::Empty,
        "/quit" | "/exit" => Input::Quit,
        "/models" => Input::Models,
        prompt => Input::Prompt(prompt),
    }
}

/// Run a chat session. With `prompt`, answer once and exit.
///
/// Returns 0 on a clean exit, 1 if a one-shot prompt fails, 3 if the runtime
/// cannot be built.
pub async fn run_chat(config: Config, model: Option<String>, prompt: Option<String>) -> i32 {
    let timeout = config.orchestrator.inference_timeout + REQUEST_MARGIN;
    let model_id = model.unwrap_or_else(|| config.orchestrator.default_model.clone());

    let runtime = match Runtime::build(config).await {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return EXIT_RUNTIME;
        }
    };
    if let Err(e) = runtime.start().await {
        eprintln!("Failed to start runtime: {}", e);
        runtime.shutdown().await;
        return EXIT_RUNTIME;
    }
    if let Err(e) = runtime.models().load(&model_id).await {
        warn!(model_id = %model_id, error = %e, "Model not loaded at chat start");
        eprintln!("Model '{}' is not available: {}", model_id, e);
    }

    let code = match prompt {
        Some(prompt) => match runtime.orchestrator().request(&prompt, Some(&model_id), timeout).await {
            Ok(reply) => {
                println!("{}", reply.content);
                EXIT_SUCCESS
            }
            Err(e) => {
                eprintln!("error: {}", e);
                EXIT_FAILURE
            }
        },
        None => repl(&runtime, &model_id, timeout).await,
    };

    if let ShutdownResult::Timeout { remaining } = runtime.shutdown().await {
        eprintln!("Shutdown timed out with {} cycle(s) still running", remaining);
    }
    code
}

async fn repl(runtime: &Runtime, model_id: &str, timeout: Duration) -> i32 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    println!("Chatting with '{}'. /models lists models, /quit exits.", model_id);

    loop {
        if stdout.write_all(b"> ").await.is_err() || stdout.flush().await.is_err() {
            return EXIT_FAILURE;
        }
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                println!();
                return EXIT_SUCCESS;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return EXIT_SUCCESS,
            Err(e) => {
                eprintln!("stdin read failed: {}", e);
                return EXIT_FAILURE;
            }
        };

        match classify(&line) {
            Input::Empty => continue,
            Input::Quit => return EXIT_SUCCESS,
            Input::Models => {
                for status in runtime.models().status() {
                    println!(
                        "{:<30} {:<10} v{}",
                        status.model_id,
                        status.state.as_str(),
                        status.version.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
                    );
                }
            }
            Input::Prompt(prompt) => {
                match runtime.orchestrator().request(prompt, Some(model_id), timeout).await {
                    Ok(reply) => println!("{}", reply.content),
                    Err(e) => eprintln!("error: {}", e),
                }
            }
        }
    }
}

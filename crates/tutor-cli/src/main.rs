//! Tutor CLI
//!
//! Interactive Python course in the terminal: lessons and exercises from the
//! completion service, code runs in a Docker sandbox, tutor feedback on every
//! run.

mod commands;
mod terminal;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;
use tutor_core::preferences;
use tutor_core::{
    CompletionClient, Config, Controller, ExecutionEngine, HttpTransport, Preferences, Renderer,
    StateKey, StateValue, Store,
};
use tutor_sandbox::PythonSandbox;

use crate::commands::{ends_editor, Command, HELP};
use crate::terminal::TerminalRenderer;

/// Tutor - interactive Python course in your terminal
///
/// Generates lessons with an LLM, runs your code in a sandboxed Python
/// interpreter and asks the tutor for feedback on the result.
#[derive(Parser, Debug)]
#[command(name = "tutor")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: tutor.json in current directory)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long)]
    verbose: bool,

    /// API key for the completion service (overrides config and environment)
    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,

    /// Interface language to use and remember (e.g. en, es, pt-BR)
    #[arg(short, long, value_name = "CODE")]
    locale: Option<String>,
}

type InputLines = Lines<BufReader<Stdin>>;

/// Everything a prompt command needs.
struct Session {
    controller: Arc<Controller>,
    renderer: Arc<TerminalRenderer>,
    preferences: Preferences,
    preferences_path: PathBuf,
    /// Workflows still waiting on the sandbox or the completion service.
    workflows: JoinSet<()>,
}

impl Session {
    /// Runs a workflow in the background so the prompt stays responsive.
    fn spawn<F, Fut>(&mut self, workflow: F)
    where
        F: FnOnce(Arc<Controller>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.workflows.spawn(workflow(Arc::clone(&self.controller)));
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Tutor starting");
    tracing::debug!(config = ?args.config, "Config file");

    match run_tutor(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

/// Wires the session, bootstraps it and runs the prompt loop.
async fn run_tutor(args: Args) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(key) = args.api_key {
        config.api.api_key = Some(key);
    }
    config.validate()?;

    let preferences_path =
        preferences::resolve_path(&std::env::current_dir()?, &config.preferences_file);
    let mut preferences = load_preferences(&preferences_path);
    if let Some(locale) = args.locale.as_deref() {
        preferences.set_locale(locale, &preferences_path)?;
    }
    tracing::debug!(locale = %preferences.locale, "Preferences loaded");

    let store = Arc::new(Store::from_config(&config));
    let transport = Arc::new(HttpTransport::new(&config.api)?);
    let client = Arc::new(CompletionClient::from_config(
        transport,
        Arc::clone(&store),
        &config,
    ));
    let sandbox = Arc::new(PythonSandbox::new(config.sandbox.clone()));
    let renderer = Arc::new(TerminalRenderer::new());

    let loading_indicator = store.subscribe(StateKey::Loading, |value| {
        if let StateValue::Loading(status) = value {
            if status.active {
                println!("... {}", status.message);
            }
        }
        Ok(())
    });
    let state_logger = tokio::spawn(log_state_changes(store.events()));

    let engine: Arc<dyn ExecutionEngine> = sandbox.clone();
    let view: Arc<dyn Renderer> = renderer.clone();
    let controller = Arc::new(Controller::new(config, store, client, engine, view));

    println!("Welcome to Tutor. Setting up your Python environment...");
    let outcome = match controller.initialize().await {
        Ok(()) => {
            println!();
            println!("Type 'help' for commands.");
            let mut session = Session {
                controller,
                renderer,
                preferences,
                preferences_path,
                workflows: JoinSet::new(),
            };
            let outcome = prompt_loop(&mut session).await;
            finish_workflows(&mut session.workflows).await;
            outcome
        }
        Err(e) => Err(e.into()),
    };

    loading_indicator.unsubscribe();
    state_logger.abort();

    println!();
    println!("Cleaning up...");
    if let Err(e) = sandbox.shutdown().await {
        tracing::warn!(error = %e, "Failed to clean up sandbox container");
    }

    outcome
}

/// Reads commands until `quit`, end of input or Ctrl+C.
///
/// Lessons, exercises, chat and code runs are spawned, so new commands are
/// accepted while earlier ones wait on the completion service.
async fn prompt_loop(session: &mut Session) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        prompt("tutor> ");
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C");
                session.workflows.abort_all();
                break;
            }
            Some(joined) = session.workflows.join_next() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Workflow task failed");
                }
                continue;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };

        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C while a command was running");
                session.workflows.abort_all();
                break;
            }
            keep_going = dispatch(session, command, &mut lines) => {
                if !keep_going? {
                    break;
                }
            }
        }
    }

    println!("Goodbye!");
    Ok(())
}

/// Executes one command; `Ok(false)` ends the session.
async fn dispatch(
    session: &mut Session,
    command: Command,
    lines: &mut InputLines,
) -> anyhow::Result<bool> {
    match command {
        Command::Empty => {}
        Command::Help => println!("{HELP}"),
        Command::Quit => return Ok(false),
        Command::Code => {
            let code = read_editor(lines).await?;
            session.renderer.set_code_input(&code);
            println!("Code saved. Type 'run' to run it.");
        }
        Command::Run => session.spawn(|c| async move { c.run_code().await }),
        Command::RunFile(path) => match tokio::fs::read_to_string(&path).await {
            Ok(code) => {
                session.renderer.set_code_input(&code);
                session.spawn(|c| async move { c.run_code().await });
            }
            Err(e) => println!("Could not read {}: {e}", path.display()),
        },
        Command::Chat(message) => {
            session.renderer.set_chat_input(&message);
            session.spawn(|c| async move { c.send_chat().await });
        }
        Command::Exercise => session.spawn(|c| async move { c.new_exercise().await }),
        Command::Lesson(topic) => {
            session.spawn(|c| async move { c.generate_lesson(topic.as_deref()).await });
        }
        Command::Reset => {
            session.controller.reset().await;
            println!("Session reset.");
        }
        Command::Status => {
            let status = session.controller.status();
            let snapshot = session.controller.store().snapshot();
            println!("Initialized:      {}", status.initialized);
            println!("Python ready:     {}", status.engine_ready);
            println!("Busy:             {}", status.loading);
            println!("Conversation:     {} turns", status.history_len);
            println!("Retry delay:      {} ms", snapshot.retry_delay_ms);
            println!("Running:          {} workflows", session.workflows.len());
            println!("Language:         {}", session.preferences.locale);
            tracing::debug!(snapshot = %serde_json::to_string(&snapshot)?, "Store snapshot");
        }
        Command::Lang(code) => {
            match session
                .preferences
                .set_locale(&code, &session.preferences_path)
            {
                Ok(()) => println!("Language set to {}.", session.preferences.locale),
                Err(e) => println!("{e}"),
            }
        }
    }
    Ok(true)
}

/// Waits for running workflows; Ctrl+C aborts them.
///
/// They must not outlive the sandbox, which is shut down next.
async fn finish_workflows(workflows: &mut JoinSet<()>) {
    let pending = workflows.len();
    if pending > 0 {
        println!("Waiting for {pending} running workflow(s)... (Ctrl+C to abort)");
    }

    let drained = async {
        while let Some(joined) = workflows.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!(error = %e, "Workflow task panicked");
                }
            }
        }
    };
    tokio::select! {
        () = drained => return,
        _ = tokio::signal::ctrl_c() => tracing::info!("Aborting running workflows"),
    }
    workflows.shutdown().await;
}

/// Collects editor lines until the terminator or end of input.
async fn read_editor(lines: &mut InputLines) -> anyhow::Result<String> {
    println!("Enter your code. Finish with a line containing only '.'");
    let mut code = String::new();
    while let Some(line) = lines.next_line().await? {
        if ends_editor(&line) {
            break;
        }
        code.push_str(&line);
        code.push('\n');
    }
    Ok(code)
}

fn prompt(text: &str) {
    use std::io::Write;

    print!("{text}");
    std::io::stdout().flush().ok();
}

/// Logs every store notification at debug level.
async fn log_state_changes(mut events: broadcast::Receiver<StateValue>) {
    loop {
        match events.recv().await {
            Ok(StateValue::History(history)) => {
                tracing::debug!(
                    turns = history.len(),
                    version = history.version(),
                    "Conversation changed"
                );
            }
            Ok(value) => tracing::debug!(key = ?value.key(), "State changed"),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "State logger fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Loads configuration from `config_path` or from `tutor.json` in the
/// current directory.
fn load_config(config_path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match config_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading config");
            Config::load_from_file(path)?
        }
        None => Config::load()?,
    };
    Ok(config)
}

/// A corrupted preferences file is not worth refusing to start over.
fn load_preferences(path: &Path) -> Preferences {
    Preferences::load(path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Ignoring unreadable preferences");
        Preferences::default()
    })
}

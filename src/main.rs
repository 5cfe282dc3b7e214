//! Flowpilot CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! flowpilot workflow.yaml
//!
//! # With input data
//! flowpilot workflow.yaml --input signup.json
//!
//! # Resume a paused execution with the missing values
//! flowpilot workflow.yaml --resume 6f1c... --input email.json
//!
//! # Make other workflows available to `workflow` steps
//! flowpilot workflow.yaml --workflows-dir ./flows --parallel 8
//! ```
//!
//! Exit status is 0 for COMPLETED and PARTIAL runs, 2 for PAUSED runs
//! and 1 otherwise.

use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::Map;

use flowpilot::config::EngineConfig;
use flowpilot::execution::{BuiltinExecutor, Engine, ExecutorRegistry, BUILTIN_SERVICE};
use flowpilot::store::{FileStateStore, InMemoryWorkflowRepository};
use flowpilot::workflow::parser::{load_input, load_workflow, load_workflow_dir};
use flowpilot::workflow::{ExecutionState, ExecutionStatus, StepStatus, WorkflowDefinition};
use flowpilot::{APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Exit status of a paused run.
const EXIT_PAUSED: u8 = 2;

/// Command-line options parsed from arguments.
#[derive(Debug)]
struct CliOptions {
    workflow_path: String,
    input_path: Option<PathBuf>,
    resume_id: Option<String>,
    config_path: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    max_parallel: Option<usize>,
    workflows_dir: Option<PathBuf>,
    verbose: bool,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            input_path: None,
            resume_id: None,
            config_path: None,
            state_dir: None,
            max_parallel: None,
            workflows_dir: None,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowpilot [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>       Path to workflow JSON or YAML file");
    println!();
    println!("Options:");
    println!("  --input FILE          Input data (JSON or YAML object)");
    println!("  --resume ID           Resume a paused execution; --input supplies new values");
    println!("  --config FILE         Engine configuration (YAML)");
    println!("  --state-dir DIR       Where execution state is stored");
    println!("  --parallel N          Maximum concurrent steps in graph mode");
    println!("  --workflows-dir DIR   Workflows callable from `workflow` steps");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  flowpilot onboarding.yaml --input signup.json");
    println!("  flowpilot onboarding.yaml --resume <EXECUTION_ID> --input email.json");
}

/// Takes the value following an option.
fn option_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", name))
}

/// Parses command-line arguments into options.
fn parse_arguments(args: &[String]) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut positional_seen = false;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = args[i].as_str();

        match arg {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                options.verbose = true;
            }
            "--input" => {
                options.input_path = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--resume" => {
                options.resume_id = Some(option_value(args, &mut i, arg)?.to_string());
            }
            "--config" => {
                options.config_path = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--state-dir" => {
                options.state_dir = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--workflows-dir" => {
                options.workflows_dir = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--parallel" => {
                let raw = option_value(args, &mut i, arg)?;
                options.max_parallel = Some(
                    raw.parse()
                        .map_err(|_| format!("Invalid parallel value: {}", raw))?,
                );
            }
            other if other.starts_with('-') => {
                return Err(format!("Unknown option: {}", other));
            }
            other => {
                if positional_seen {
                    return Err(format!("Unexpected argument: {}", other));
                }
                options.workflow_path = other.to_string();
                positional_seen = true;
            }
        }
        i += 1;
    }

    Ok(options)
}

/// Builds the engine configuration: file, then environment, then flags.
fn load_config(options: &CliOptions) -> Result<EngineConfig, Box<dyn Error>> {
    let mut config = match &options.config_path {
        Some(path) => {
            info!("Loading configuration: {}", path.display());
            EngineConfig::load(path)?
        }
        None => EngineConfig::default(),
    }
    .apply_env_overrides();

    if let Some(dir) = &options.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(max) = options.max_parallel {
        config.max_concurrency = max;
    }
    Ok(config.normalized())
}

/// Prints one line per step in declaration order.
fn print_summary(workflow: &WorkflowDefinition, state: &ExecutionState) {
    println!();
    println!("{}", "Step summary".bold());
    for node in &workflow.nodes {
        let status = state.step_status(&node.id);
        let label = match status {
            StepStatus::Completed => status.to_string().green(),
            StepStatus::Failed => status.to_string().red(),
            StepStatus::Paused => status.to_string().yellow(),
            StepStatus::Skipped => status.to_string().cyan(),
            _ => status.to_string().dimmed(),
        };
        match state.steps.get(&node.id).and_then(|s| s.error.as_deref()) {
            Some(message) => println!("  {:<24} {:<10} {}", node.label(), label, message.red()),
            None => println!("  {:<24} {}", node.label(), label),
        }
    }

    println!();
    let status = match state.status {
        ExecutionStatus::Completed => state.status.to_string().green().bold(),
        ExecutionStatus::Partial | ExecutionStatus::Paused => state.status.to_string().yellow().bold(),
        _ => state.status.to_string().red().bold(),
    };
    println!("Execution {}: {}", state.execution_id, status);

    if let Some(pause) = &state.pause {
        println!(
            "Waiting for '{}' at step '{}'. Resume with:",
            pause.missing_var, pause.step_id
        );
        println!("  flowpilot <WORKFLOW_FILE> --resume {} --input <FILE>", state.execution_id);
    }
}

fn exit_code(status: ExecutionStatus) -> ExitCode {
    match status {
        ExecutionStatus::Completed | ExecutionStatus::Partial => ExitCode::SUCCESS,
        ExecutionStatus::Paused => ExitCode::from(EXIT_PAUSED),
        _ => ExitCode::FAILURE,
    }
}

/// Main application entry point.
async fn run() -> Result<ExitCode, Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();

    let options = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(options.verbose);
    print_banner();

    let config = load_config(&options)?;

    info!("Loading workflow: {}", options.workflow_path);
    let workflow = load_workflow(&options.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            options.workflow_path, e
        )
    })?;
    info!(
        "Workflow '{}' loaded: {} nodes, {} connections, services {:?}",
        workflow.id,
        workflow.nodes.len(),
        workflow.connections.len(),
        workflow.services()
    );

    let input = match &options.input_path {
        Some(path) => load_input(path)?,
        None => Map::new(),
    };

    info!("State directory: {}", config.state_dir.display());
    let registry = ExecutorRegistry::new().with(BUILTIN_SERVICE, BuiltinExecutor);
    let store = Arc::new(FileStateStore::new(config.state_dir.clone()));
    let mut engine = Engine::new(registry, store);
    engine.set_config(config);

    if let Some(dir) = &options.workflows_dir {
        let workflows = load_workflow_dir(dir)?;
        info!("Loaded {} callable workflow(s) from {}", workflows.len(), dir.display());
        engine.set_workflow_repository(Arc::new(InMemoryWorkflowRepository::from_workflows(
            workflows.into_iter().chain(std::iter::once(workflow.clone())),
        )));
    }

    let state = match &options.resume_id {
        Some(execution_id) => {
            if input.is_empty() {
                warn!("Resuming without new input; the execution will likely pause again");
            }
            engine.resume(&workflow, execution_id, input).await?
        }
        None => engine.run(&workflow, input).await?,
    };

    print_summary(&workflow, &state);
    Ok(exit_code(state.status))
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

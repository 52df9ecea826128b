//! `strata` command line front end.
//!
//! Runs workflow definitions against the built-in function registry and
//! inspects dispatch states persisted in the file store.

mod config;

use crate::config::CliConfig;
use clap::{Parser, Subcommand};
use rootcause::prelude::{Report, ResultExt};
use serde_json::{Value as JsonValue, json};
use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use strata_core::DispatchId;
use strata_workflow::{
    BackgroundJobExecutor, ExecutionState, ExecutorRegistry, FileStore, FunctionRegistry, Runner,
    StateStore, TracingNotifier, WorkflowDefinition, WorkflowInputs, WorkflowStatus,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Name the background job executor is registered under.
const JOB_EXECUTOR: &str = "jobs";

/// Strata - a layered workflow dispatcher
#[derive(Parser)]
#[command(name = "strata")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a workflow definition to completion
    Run {
        /// Path to the workflow definition (JSON)
        definition: PathBuf,

        /// Positional input, as JSON
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Keyword input, as NAME=JSON
        #[arg(long = "kwarg")]
        kwargs: Vec<String>,
    },
    /// Print a persisted dispatch
    Show {
        dispatch_id: DispatchId,

        /// Print the whole execution state instead of a summary
        #[arg(long)]
        full: bool,
    },
    /// Continue a persisted dispatch that did not settle
    Resume { dispatch_id: DispatchId },
    /// List the registered task functions
    Functions,
}

#[derive(Debug)]
enum CliError {
    Config,
    ReadDefinition { path: PathBuf },
    InvalidInput { input: String },
    Store,
    Dispatch,
    Output,
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => write!(f, "failed to load configuration"),
            Self::ReadDefinition { path } => {
                write!(f, "failed to read workflow definition {}", path.display())
            }
            Self::InvalidInput { input } => write!(f, "invalid input '{input}'"),
            Self::Store => write!(f, "state store unavailable"),
            Self::Dispatch => write!(f, "dispatch failed"),
            Self::Output => write!(f, "failed to render output"),
        }
    }
}

impl std::error::Error for CliError {}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> strata_core::Result<ExitCode, CliError> {
    let config = CliConfig::load(cli.config.as_deref()).context(CliError::Config)?;
    tracing::debug!(?config, "loaded configuration");

    let store = FileStore::open(&config.state_dir)
        .await
        .context(CliError::Store)?;
    let functions = FunctionRegistry::with_builtins();
    let executors = ExecutorRegistry::with_local(config.local_workers)
        .with_job(JOB_EXECUTOR, BackgroundJobExecutor::new(config.local_workers));
    let runner = Runner::new(functions, executors)
        .with_store(store.clone())
        .with_notifier(TracingNotifier)
        .with_config(config.runner);

    match cli.command {
        Command::Run {
            definition,
            args,
            kwargs,
        } => {
            let raw = tokio::fs::read_to_string(&definition)
                .await
                .context(CliError::ReadDefinition {
                    path: definition.clone(),
                })?;
            let workflow = WorkflowDefinition::from_json(&raw).context(CliError::ReadDefinition {
                path: definition.clone(),
            })?;
            let inputs = parse_inputs(&args, &kwargs)?;
            let state = runner
                .dispatch(workflow, inputs)
                .await
                .context(CliError::Dispatch)?;
            print_state(&state, false)?;
            Ok(exit_code(&state))
        }
        Command::Show { dispatch_id, full } => {
            let state = store.load(&dispatch_id).await.context(CliError::Store)?;
            print_state(&state, full)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Resume { dispatch_id } => {
            let mut state = store.load(&dispatch_id).await.context(CliError::Store)?;
            runner.execute(&mut state).await.context(CliError::Dispatch)?;
            print_state(&state, false)?;
            Ok(exit_code(&state))
        }
        Command::Functions => {
            for name in FunctionRegistry::with_builtins().names() {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Parses `--arg JSON` and `--kwarg NAME=JSON` values.
fn parse_inputs(
    args: &[String],
    kwargs: &[String],
) -> strata_core::Result<WorkflowInputs, CliError> {
    let parse = |input: &str, raw: &str| -> strata_core::Result<JsonValue, CliError> {
        serde_json::from_str(raw).context(CliError::InvalidInput {
            input: input.to_string(),
        })
    };

    let mut inputs = WorkflowInputs::new();
    for arg in args {
        inputs = inputs.with_arg(parse(arg, arg)?);
    }
    for kwarg in kwargs {
        let Some((name, raw)) = kwarg.split_once('=') else {
            return Err(CliError::InvalidInput {
                input: kwarg.clone(),
            }
            .into());
        };
        inputs = inputs.with_kwarg(name, parse(kwarg, raw)?);
    }
    Ok(inputs)
}

fn summary(state: &ExecutionState) -> JsonValue {
    let nodes: serde_json::Map<String, JsonValue> = state
        .graph
        .nodes()
        .map(|node| {
            let record = state.node(node.id);
            (
                node.id.to_string(),
                json!({
                    "name": node.name,
                    "status": record.map(|r| r.status),
                    "output": record.and_then(|r| r.output.clone()),
                    "error": record.and_then(|r| r.error.clone()),
                }),
            )
        })
        .collect();
    json!({
        "dispatch_id": state.dispatch_id.to_string(),
        "workflow": state.definition.name,
        "status": state.status,
        "final_result": state.final_result,
        "error": state.error,
        "nodes": nodes,
    })
}

fn print_state(state: &ExecutionState, full: bool) -> strata_core::Result<(), CliError> {
    let rendered = if full {
        serde_json::to_string_pretty(state)
    } else {
        serde_json::to_string_pretty(&summary(state))
    };
    println!("{}", rendered.context(CliError::Output)?);
    Ok(())
}

fn exit_code(state: &ExecutionState) -> ExitCode {
    match state.status {
        WorkflowStatus::Completed | WorkflowStatus::PendingPostprocessing => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}

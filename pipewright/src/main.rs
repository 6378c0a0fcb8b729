//! Pipewright CLI
//!
//! Runs pipelines, prints execution plans and summarizes run manifests.
//! Only the demo processors (`echo`, `fail`) are registered here; real
//! agents are linked in by embedding the library.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pipewright::cancellation::CancellationToken;
use pipewright::config::EngineConfig;
use pipewright::definition::{
    variables::parse_assignments, LoadedPipeline, PipelineLoader, PipelineSource, Variables,
};
use pipewright::errors::{ConfigError, EngineError};
use pipewright::events::LoggingEventSink;
use pipewright::manifest::check_status;
use pipewright::orchestrator::{ArticleState, Orchestrator, RunRequest, RunResult, StateMachine};
use pipewright::worker::demo::{EchoProcessor, FailProcessor};
use pipewright::worker::ProcessorRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "pipewright")]
#[command(about = "Pipeline orchestration engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Engine configuration file (YAML or JSON)
    #[arg(long, global = true, env = "PIPEWRIGHT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline for a topic
    Run {
        /// Topic handed to every stage
        topic: String,

        /// Pipeline definition file
        #[arg(long, default_value = "pipeline.yaml")]
        pipeline: PathBuf,

        /// Print the execution plan without running anything
        #[arg(long)]
        dry_run: bool,

        /// Ignore cached stage outputs
        #[arg(long)]
        no_cache: bool,

        /// Concurrency for every queue
        #[arg(long)]
        parallel: Option<usize>,

        /// Pipeline variable as name=value (repeatable)
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// Manifest path; in state-machine mode an existing file is resumed
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Execution mode
        #[arg(long, value_enum, default_value_t = Mode::Queue)]
        mode: Mode,
    },
    /// Summarize a run manifest
    CheckStatus {
        /// Manifest file
        manifest: PathBuf,
    },
    /// Print the execution plan of a pipeline
    Plan {
        /// Pipeline definition file
        pipeline: PathBuf,

        /// Pipeline variable as name=value (repeatable)
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Level-by-level execution through job queues
    Queue,
    /// Fixed sequential states with in-place retries
    StateMachine,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    let code = match handle_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            report(&e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("pipewright={level}")));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Routes the command to its handler and returns the process exit code.
async fn handle_command(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run {
            topic,
            pipeline,
            dry_run,
            no_cache,
            parallel,
            vars,
            manifest,
            mode,
        } => {
            let config = EngineConfig::load(cli.config.as_deref())?;
            let variables = parse_assignments(&vars)?;
            let mut request = RunRequest::new(&topic).with_variables(variables.clone());
            if no_cache {
                request = request.without_cache();
            }
            if let Some(parallel) = parallel {
                request = request.with_parallel(parallel);
            }

            match mode {
                Mode::Queue => {
                    let loaded = PipelineLoader::new()
                        .with_topic(&topic)
                        .with_variables(variables)
                        .load(&PipelineSource::file(&pipeline))?;
                    if dry_run {
                        print!("{}", loaded.plan.describe());
                        return Ok(0);
                    }
                    if let Some(path) = manifest {
                        request = request.with_manifest_path(path);
                    }
                    let request = request.with_cancellation(cancel_on_interrupt());
                    let orchestrator = Orchestrator::from_config(demo_registry(), &config)?
                        .with_event_sink(Arc::new(LoggingEventSink::default()));
                    let result = orchestrator.run(&loaded, request).await?;
                    Ok(summarize(&result))
                }
                Mode::StateMachine => {
                    let machine = StateMachine::from_config(state_machine_registry(&config), &config)?
                        .with_event_sink(Arc::new(LoggingEventSink::default()));
                    if dry_run {
                        for state in ArticleState::ALL {
                            match machine.agent_for(state) {
                                Some(agent) => println!("{state}: {agent}"),
                                None => println!("{state}"),
                            }
                        }
                        return Ok(0);
                    }
                    let request = request.with_cancellation(cancel_on_interrupt());
                    let result = match manifest {
                        Some(path) if path.exists() => machine.resume(&path, &request).await?,
                        Some(path) => machine.run(&request.with_manifest_path(path)).await?,
                        None => machine.run(&request).await?,
                    };
                    Ok(summarize(&result))
                }
            }
        }
        Commands::CheckStatus { manifest } => {
            let summary = check_status(&manifest)
                .await
                .with_context(|| format!("Failed to read manifest {}", manifest.display()))?;
            print!("{summary}");
            Ok(0)
        }
        Commands::Plan { pipeline, vars } => {
            let variables = parse_assignments(&vars)?;
            let loaded = load_for_plan(&pipeline, variables)?;
            println!("Pipeline: {}", loaded.name());
            print!("{}", loaded.plan.describe());
            Ok(0)
        }
    }
}

fn load_for_plan(pipeline: &Path, variables: Variables) -> Result<LoadedPipeline, ConfigError> {
    PipelineLoader::new()
        .with_variables(variables)
        .load(&PipelineSource::file(pipeline))
}

fn demo_registry() -> ProcessorRegistry {
    ProcessorRegistry::new()
        .with("echo", EchoProcessor)
        .with("fail", FailProcessor::default())
}

/// Demo registry for state-machine mode: every mapped agent echoes unless
/// it is explicitly mapped to `fail`.
fn state_machine_registry(config: &EngineConfig) -> ProcessorRegistry {
    let mut registry = demo_registry();
    for state in ArticleState::ALL {
        if let Some(agent) = state.default_agent() {
            registry.register(agent, EchoProcessor);
        }
    }
    for agent in config.state_machine.agents.values() {
        if !registry.contains(agent) {
            registry.register(agent.clone(), EchoProcessor);
        }
    }
    registry
}

fn cancel_on_interrupt() -> Arc<CancellationToken> {
    let token = Arc::new(CancellationToken::new());
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; no further stages will be dispatched");
            handle.cancel("interrupted");
        }
    });
    token
}

fn summarize(result: &RunResult) -> i32 {
    if result.succeeded() {
        info!(
            run_id = %result.run_id,
            manifest = %result.manifest_path.display(),
            steps = result.manifest.steps.len(),
            "Run succeeded"
        );
    } else {
        let halt = result.manifest.halted_by.as_ref();
        error!(
            run_id = %result.run_id,
            manifest = %result.manifest_path.display(),
            stage = halt.and_then(|h| h.stage.as_deref()).unwrap_or("-"),
            reason = halt.map_or("-", |h| h.reason.as_str()),
            "Run failed"
        );
    }
    println!("{}", result.manifest_path.display());
    result.exit_code()
}

fn report(err: &anyhow::Error) {
    let config_error = err.downcast_ref::<ConfigError>().or_else(|| {
        err.downcast_ref::<EngineError>().and_then(|e| match e {
            EngineError::Config(c) => Some(c),
            _ => None,
        })
    });
    if let Some(config_error) = config_error {
        let info = config_error.info();
        eprintln!("error[{}]: {}", info.code, info.summary);
        if let Some(hint) = info.fix_hint {
            eprintln!("  hint: {hint}");
        }
        return;
    }
    eprintln!("error: {err:#}");
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    err.downcast_ref::<EngineError>()
        .map_or(1, EngineError::exit_code)
}

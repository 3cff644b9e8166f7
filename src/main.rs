// msflow - workflow runner for mass-spectrometry tool pipelines
//
// Operator CLI: starts workflows (locally or on the queue), reports their
// status, cancels them, edits parameters and inspects the result cache.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use msflow::config::ConfigManager;
use msflow::executor::logger::ERROR_PREFIX;
use msflow::executor::{ProcessMarkers, WorkflowLogger};
use msflow::params::ParameterUpdate;
use msflow::utils::logging::init_logging;
use msflow::workflow::{
    EngineContext, LogDetail, NoProgress, RunState, WorkflowDir, WorkflowManager, WorkflowStatus,
};

/// msflow - run mass-spectrometry workflows locally or on a job queue
#[derive(Parser)]
#[command(name = "msflow")]
#[command(about = "Run, observe and configure mass-spectrometry tool workflows")]
#[command(version)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "MSFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a workflow run
    Run {
        /// Workflow definition (YAML)
        definition: PathBuf,
        /// Follow the run until it ends (Ctrl-C cancels it)
        #[arg(long)]
        wait: bool,
    },
    /// Show the state of the latest run
    Status {
        definition: PathBuf,
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stop the current run
    Cancel { definition: PathBuf },
    /// Print the log of the latest run
    Logs {
        definition: PathBuf,
        /// Detail level: minimal, commands or all
        #[arg(long, default_value = "minimal")]
        detail: LogDetail,
    },
    /// Inspect and edit workflow parameters
    Params {
        definition: PathBuf,
        #[command(subcommand)]
        action: ParamsAction,
    },
    /// Inspect the result cache
    Cache {
        definition: PathBuf,
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Report queue backend health and queue counters
    Health,
    /// Execute a workflow in this process (used by local runs)
    #[command(hide = true)]
    RunLocal {
        #[arg(long)]
        workflow_dir: PathBuf,
        #[arg(long)]
        definition: PathBuf,
    },
}

#[derive(Subcommand)]
enum ParamsAction {
    /// Print stored parameters, or the effective values of one tool
    Show {
        /// Tool or instance key
        #[arg(long)]
        tool: Option<String>,
    },
    /// Set a parameter; values are parsed as JSON when possible
    Set {
        /// Tool or instance key; sets a general parameter when omitted
        #[arg(long)]
        tool: Option<String>,
        name: String,
        value: String,
    },
    /// Drop every stored parameter
    Reset,
    /// Apply a named preset
    Preset { name: String },
    /// List presets available for this workflow
    Presets,
}

#[derive(Subcommand)]
enum CacheAction {
    /// List datasets having the given tags
    List {
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Match datasets having any instead of all tags
        #[arg(long)]
        any: bool,
    },
    /// Delete one dataset and its files
    Remove { dataset: String },
    /// Delete the whole cache
    Clear,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let manager = ConfigManager::load(args.config.as_deref()).await?;
    let config = manager.config().clone();

    // Local workers run detached; keep their diagnostics in the log dir
    let log_dir = match &args.command {
        Command::RunLocal { .. } => config.log_dir.as_deref(),
        _ => None,
    };
    let _guard = init_logging(args.verbose, false, log_dir, "msflow-local.log")?;

    let validation = manager.validate();
    for warning in &validation.warnings {
        tracing::warn!("{}", warning);
    }
    if !validation.is_valid {
        bail!("Invalid configuration: {}", validation.errors.join("; "));
    }

    let config_file = manager.source_file().map(Path::to_path_buf);

    match args.command {
        Command::Run { definition, wait } => {
            let context = EngineContext::initialize(config, config_file).await?;
            let workflow = WorkflowManager::open(&context, &definition)?;
            let mode = workflow.start().await?;
            println!("Started {} ({} execution)", workflow.definition().name, mode);
            if wait {
                let status = follow(&workflow, &context).await?;
                if status.status != RunState::Finished {
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Command::Status { definition, json } => {
            let context = EngineContext::initialize(config, config_file).await?;
            let workflow = WorkflowManager::open(&context, &definition)?;
            let status = workflow.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Command::Cancel { definition } => {
            let context = EngineContext::initialize(config, config_file).await?;
            let workflow = WorkflowManager::open(&context, &definition)?;
            if workflow.cancel().await? {
                println!("Canceled {}", workflow.definition().name);
            } else {
                println!("{} is not running", workflow.definition().name);
            }
        }
        Command::Logs { definition, detail } => {
            let context = EngineContext::offline(config)?;
            let workflow = WorkflowManager::open(&context, &definition)?;
            match workflow.logger().read(detail) {
                Some(text) => print!("{}", text),
                None => println!("No {} log for {}", detail.file_name(), workflow.definition().name),
            }
        }
        Command::Params { definition, action } => {
            let context = EngineContext::offline(config)?;
            let workflow = WorkflowManager::open(&context, &definition)?;
            run_params(&workflow, action).await?;
        }
        Command::Cache { definition, action } => {
            let context = EngineContext::offline(config)?;
            let workflow = WorkflowManager::open(&context, &definition)?;
            let cache = workflow.files().cache();
            match action {
                CacheAction::List { tags, any } => {
                    let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
                    for dataset in cache.list_datasets(&tags, any)? {
                        println!("{}", dataset);
                    }
                }
                CacheAction::Remove { dataset } => {
                    cache.remove(&dataset)?;
                    println!("Removed {}", dataset);
                }
                CacheAction::Clear => {
                    cache.clear()?;
                    println!("Cache cleared");
                }
            }
        }
        Command::Health => {
            let context = EngineContext::initialize(config, config_file).await?;
            let health = context.queue.get_store_health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            if let Some(stats) = context.queue.get_queue_stats().await {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }
        Command::RunLocal {
            workflow_dir,
            definition,
        } => {
            let context = EngineContext::offline(config)?;
            let layout = WorkflowDir::new(workflow_dir);
            let workflow = match WorkflowManager::with_layout(&context, layout.clone(), &definition) {
                Ok(workflow) => workflow,
                Err(e) => {
                    // Leave the failure where status readers look for it
                    WorkflowLogger::new(&layout).log(&format!("{}{:#}", ERROR_PREFIX, e), LogDetail::Minimal);
                    ProcessMarkers::new(layout.pids_dir()).clear();
                    return Err(e);
                }
            };
            let report = workflow.run_in_process(Arc::new(NoProgress)).await;
            if !report.success {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Poll until the run ends; Ctrl-C cancels it
async fn follow(workflow: &WorkflowManager, context: &EngineContext) -> Result<WorkflowStatus> {
    let poll_interval = context.config.queue.poll_interval;
    let mut last_step = String::new();
    loop {
        let status = workflow.status().await;
        if status.current_step != last_step && !status.current_step.is_empty() {
            println!("  {:>5.1}%  {}", status.progress * 100.0, status.current_step);
            last_step = status.current_step.clone();
        }
        if !status.running {
            print_status(&status);
            return Ok(status);
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                println!("Canceling...");
                workflow.cancel().await?;
            }
        }
    }
}

fn print_status(status: &WorkflowStatus) {
    println!("Status:   {} ({})", status.status, status.mode);
    println!("Progress: {:.0}%", status.progress * 100.0);
    if !status.current_step.is_empty() {
        println!("Step:     {}", status.current_step);
    }
    if let Some(job_id) = &status.job_id {
        println!("Job:      {}", job_id);
    }
    if let (Some(position), Some(length)) = (status.queue_position, status.queue_length) {
        println!("Queue:    {} of {}", position, length);
    }
    if let Some(error) = &status.error {
        println!("Error:    {}", error);
    }
}

async fn run_params(workflow: &WorkflowManager, action: ParamsAction) -> Result<()> {
    let params = workflow.parameters();
    match action {
        ParamsAction::Show { tool: None } => {
            println!("{}", serde_json::to_string_pretty(&params.load().to_json())?);
        }
        ParamsAction::Show { tool: Some(key) } => {
            let values = params.resolve(&key).await?;
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
        ParamsAction::Set { tool, name, value } => {
            let value = serde_json::from_str::<Value>(&value).unwrap_or(Value::String(value));
            let update = match &tool {
                Some(key) => ParameterUpdate::new().tool(key, &name, value),
                None => ParameterUpdate::new().general(&name, value),
            };
            params.save(update).await?;
            println!("Saved {}", name);
        }
        ParamsAction::Reset => {
            params.reset()?;
            println!("Parameters reset to defaults");
        }
        ParamsAction::Preset { name } => {
            if !params.apply_preset(&name)? {
                bail!("Unknown preset '{}'", name);
            }
            println!("Applied preset {}", name);
        }
        ParamsAction::Presets => {
            for name in params.preset_names() {
                let description = params.preset_description(&name);
                if description.is_empty() {
                    println!("{}", name);
                } else {
                    println!("{} - {}", name, description);
                }
            }
        }
    }
    Ok(())
}

// Workflow body
//
// Runs the steps of a definition against one workflow directory. The same
// body runs in a local worker process and in a queue worker; both wrap it in
// `WorkflowRunner::run`, which catches every failure (panics included),
// writes it to the log and always clears the process markers.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::executor::logger::{CANCEL_SENTINEL, ERROR_PREFIX, FINISH_SENTINEL, START_SENTINEL};
use crate::executor::{ArgItem, CommandExecutor, ToolInvocation};
use crate::files::{FileInput, FileManager, FileOptions, FileSource, ResultsDir};
use crate::params::ParameterManager;
use crate::workflow::definition::{ArgumentBinding, CacheDirective, StepDefinition, WorkflowDefinition};
use crate::workflow::layout::LogDetail;

/// Progress checkpoints reported while a run advances
pub mod checkpoint {
    pub const INIT: f64 = 0.0;
    pub const LOADING_PARAMETERS: f64 = 0.05;
    pub const STARTING: f64 = 0.1;
    /// Step execution spans `EXECUTING..FINISHING`
    pub const EXECUTING: f64 = 0.15;
    pub const FINISHING: f64 = 0.95;
    pub const FINISHED: f64 = 1.0;
}

/// Receives progress of a running workflow
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// `progress` is in 0..1, `step` a short label
    async fn report(&self, progress: f64, step: &str);
}

/// Discards progress; local runs are observed through their log
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _progress: f64, _step: &str) {}
}

/// Why a run was abandoned before it completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Stopped on request
    Canceled,
    /// Ran past its time limit
    TimedOut(Duration),
}

/// Outcome of a run, as written to the log
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub success: bool,
    pub canceled: bool,
    pub error: Option<String>,
}

/// Resolved arguments of one step, in binding order
type BoundArgs = Vec<(String, Vec<ArgItem>)>;

/// Executes a workflow definition
#[derive(Clone)]
pub struct WorkflowRunner {
    definition: Arc<WorkflowDefinition>,
    params: Arc<ParameterManager>,
    files: Arc<FileManager>,
    executor: CommandExecutor,
}

impl WorkflowRunner {
    pub fn new(
        definition: Arc<WorkflowDefinition>,
        params: Arc<ParameterManager>,
        files: Arc<FileManager>,
        executor: CommandExecutor,
    ) -> Self {
        Self {
            definition,
            params,
            files,
            executor,
        }
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Run the workflow inside the failure boundary.
    ///
    /// Success is recorded only by the final `WORKFLOW FINISHED` line;
    /// anything else ends the log with the error and its causes.
    pub async fn run(&self, progress: Arc<dyn ProgressSink>) -> RunReport {
        self.run_until(progress, std::future::pending()).await
    }

    /// Like [`run`](Self::run), but abandon the run when `stop` resolves
    /// first. Dropping the body kills every tool it is running.
    pub async fn run_until<F>(&self, progress: Arc<dyn ProgressSink>, stop: F) -> RunReport
    where
        F: Future<Output = Interrupt>,
    {
        let body = self.clone();
        let sink = Arc::clone(&progress);
        let mut handle = tokio::spawn(async move { body.execute(sink).await });

        let outcome = tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(anyhow!("workflow panicked: {}", panic_message(e))),
                Err(e) => Err(anyhow!("workflow task was cancelled: {}", e)),
            },
            interrupt = stop => {
                handle.abort();
                let _ = handle.await;
                self.executor.cancel();
                match interrupt {
                    Interrupt::Canceled => Ok(Some(interrupt)),
                    Interrupt::TimedOut(limit) => Err(anyhow!(
                        "workflow exceeded its time limit of {} seconds",
                        limit.as_secs()
                    )),
                }
            }
        };

        let logger = self.executor.logger();
        let report = match outcome {
            Ok(None) => {
                logger.log(FINISH_SENTINEL, LogDetail::Minimal);
                progress.report(checkpoint::FINISHED, "Finished").await;
                tracing::info!("Workflow '{}' finished", self.definition.name);
                RunReport {
                    success: true,
                    canceled: false,
                    error: None,
                }
            }
            Ok(Some(_)) => {
                logger.log(CANCEL_SENTINEL, LogDetail::Minimal);
                tracing::info!("Workflow '{}' canceled", self.definition.name);
                RunReport {
                    success: false,
                    canceled: true,
                    error: None,
                }
            }
            Err(e) => {
                logger.log(&format!("{}{}", ERROR_PREFIX, e), LogDetail::Minimal);
                logger.log(&format!("{:?}", e), LogDetail::Minimal);
                tracing::error!("Workflow '{}' failed: {:#}", self.definition.name, e);
                RunReport {
                    success: false,
                    canceled: false,
                    error: Some(format!("{:#}", e)),
                }
            }
        };

        self.executor.markers().clear();
        report
    }

    async fn execute(&self, progress: Arc<dyn ProgressSink>) -> Result<Option<Interrupt>> {
        let logger = self.executor.logger();

        progress.report(checkpoint::INIT, "Initializing").await;
        logger.log(START_SENTINEL, LogDetail::Minimal);

        let results_dir = self.params.layout().results_dir();
        crate::utils::remove_dir_if_exists(&results_dir)
            .with_context(|| format!("Failed to clear results in {}", results_dir.display()))?;

        progress
            .report(checkpoint::LOADING_PARAMETERS, "Loading parameters")
            .await;
        let general = self.params.load().general;

        progress.report(checkpoint::STARTING, "Starting workflow").await;

        let steps = &self.definition.steps;
        let span = checkpoint::FINISHING - checkpoint::EXECUTING;
        let mut resolved: HashMap<String, BoundArgs> = HashMap::new();

        for (index, step) in steps.iter().enumerate() {
            let fraction = index as f64 / steps.len() as f64;
            progress
                .report(
                    checkpoint::EXECUTING + span * fraction,
                    &format!("Executing {}", step.label()),
                )
                .await;
            logger.log(
                &format!("Step {}/{}: {}", index + 1, steps.len(), step.label()),
                LogDetail::Minimal,
            );

            let bound = self.run_step(step, &general, &resolved).await?;
            resolved.insert(step.id.clone(), bound);
        }

        progress.report(checkpoint::FINISHING, "Finishing").await;
        Ok(None)
    }

    async fn run_step(
        &self,
        step: &StepDefinition,
        general: &BTreeMap<String, Value>,
        resolved: &HashMap<String, BoundArgs>,
    ) -> Result<BoundArgs> {
        let mut bound: BoundArgs = Vec::new();
        for binding in &step.args {
            let input = binding_input(binding, general, &bound, resolved)
                .with_context(|| format!("Cannot bind '{}' of step '{}'", binding.name, step.id))?;

            let mut options = FileOptions::new().collect(binding.collect);
            if let Some(file_type) = &binding.file_type {
                options = options.file_type(file_type);
            }
            if let Some(results_dir) = &binding.results_dir {
                options = options.results_dir(ResultsDir::parse(results_dir));
            }

            let items = self
                .files
                .get_files(input, &options)
                .with_context(|| format!("No files for '{}' of step '{}'", binding.name, step.id))?;
            bound.push((binding.name.clone(), items));
        }

        let succeeded = match &step.interpreter {
            // Script steps take `params` as their defaults
            Some(interpreter) => {
                self.executor
                    .run_script(interpreter, &step.tool, step.parameter_key(), &step.params, &bound)
                    .await
            }
            None => {
                let mut invocation = ToolInvocation::new(&step.tool);
                if let Some(instance) = &step.instance {
                    invocation = invocation.instance(instance);
                }
                for (name, items) in &bound {
                    invocation = invocation.arg(name, items.iter().cloned());
                }
                for (name, value) in &step.params {
                    invocation = invocation.custom(name, value.clone());
                }
                self.executor.run_tool(&invocation).await
            }
        }
        .with_context(|| format!("Step '{}' could not run {}", step.id, step.tool))?;

        if !succeeded {
            if step.continue_on_error {
                self.executor.logger().log(
                    &format!("Step '{}' failed, continuing", step.label()),
                    LogDetail::Minimal,
                );
                return Ok(bound);
            }
            bail!("Step '{}' ({}) failed", step.label(), step.tool);
        }

        if let Some(cache) = &step.cache {
            self.cache_outputs(cache, &bound)
                .with_context(|| format!("Failed to cache results of step '{}'", step.id))?;
        }
        Ok(bound)
    }

    /// Store produced files under the stems of their paired inputs
    fn cache_outputs(&self, cache: &CacheDirective, bound: &BoundArgs) -> Result<()> {
        let produced = flat_paths(bound, &cache.file_from);
        let sources = flat_paths(bound, &cache.dataset_from);

        for (index, path) in produced.iter().enumerate() {
            let source = if sources.len() == produced.len() {
                &sources[index]
            } else if sources.len() == 1 {
                &sources[0]
            } else {
                path
            };
            let path = Path::new(path);
            if !path.is_file() {
                tracing::warn!("Expected output {:?} is missing, not caching it", path);
                continue;
            }
            let dataset = dataset_id(source);
            let stored = self.files.cache().store_file(
                &dataset,
                &cache.tag,
                FileSource::Path { path, remove: false },
            )?;
            self.executor.logger().log(
                &format!("Cached {} as {}/{}", stored.display(), dataset, cache.tag),
                LogDetail::Commands,
            );
        }
        Ok(())
    }
}

/// Files a binding starts from, before type and location rewrites
fn binding_input(
    binding: &ArgumentBinding,
    general: &BTreeMap<String, Value>,
    bound: &BoundArgs,
    resolved: &HashMap<String, BoundArgs>,
) -> Result<FileInput> {
    if let Some(param) = &binding.param {
        let value = general
            .get(param)
            .ok_or_else(|| anyhow!("general parameter '{}' is not set", param))?;
        return value_input(value)
            .ok_or_else(|| anyhow!("general parameter '{}' does not hold file paths", param));
    }

    if let Some(files) = &binding.files {
        return Ok(match files.as_slice() {
            [single] => FileInput::from(single.as_str()),
            many => FileInput::from(many.to_vec()),
        });
    }

    if let Some(reference) = binding.like_ref() {
        let args = match reference.step {
            None => bound,
            Some(step) => resolved
                .get(step)
                .ok_or_else(|| anyhow!("step '{}' has not run", step))?,
        };
        let items = args
            .iter()
            .find(|(name, _)| name == reference.arg)
            .map(|(_, items)| items.clone())
            .ok_or_else(|| anyhow!("argument '{}' is not bound", reference.arg))?;
        return Ok(FileInput::Items(items));
    }

    bail!("no file source given")
}

/// A path string, a list of paths, or a list mixing paths and path groups
fn value_input(value: &Value) -> Option<FileInput> {
    match value {
        Value::String(path) => Some(FileInput::from(path.as_str())),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(path) => Some(ArgItem::Single(path.clone())),
                Value::Array(group) => group
                    .iter()
                    .map(|p| p.as_str().map(String::from))
                    .collect::<Option<Vec<_>>>()
                    .map(ArgItem::Group),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(FileInput::Items),
        _ => None,
    }
}

fn flat_paths(bound: &BoundArgs, arg: &str) -> Vec<String> {
    bound
        .iter()
        .find(|(name, _)| name == arg)
        .map(|(_, items)| {
            items
                .iter()
                .flat_map(|item| item.paths())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Dataset id of a file: its name without extension
fn dataset_id(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn panic_message(e: tokio::task::JoinError) -> String {
    let payload = e.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// Workflow management for msflow
//
// Ties one workflow directory to its definition, parameters, files and
// tool executor, and picks the scheduler that runs it. Everything durable
// lives in the directory, so a manager can be rebuilt from the path alone.

pub mod definition;
pub mod layout;
pub mod runner;
pub mod scheduler;
pub mod types;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::executor::{CommandExecutor, WorkflowLogger};
use crate::files::FileManager;
use crate::params::ParameterManager;
use crate::queue::QueueManager;

// Re-export commonly used types
pub use definition::{ArgumentBinding, CacheDirective, StepDefinition, WorkflowDefinition};
pub use layout::{LogDetail, WorkflowDir};
pub use runner::{NoProgress, ProgressSink, RunReport, WorkflowRunner};
pub use scheduler::{DistributedScheduler, LocalScheduler, Scheduler, WorkerLauncher};
pub use types::{ExecutionMode, RunState, WorkflowStatus};

/// Process-wide state shared by every workflow manager
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub queue: Arc<QueueManager>,
    pub launcher: WorkerLauncher,
}

impl EngineContext {
    pub fn new(config: EngineConfig, queue: Arc<QueueManager>, launcher: WorkerLauncher) -> Self {
        Self {
            config,
            queue,
            launcher,
        }
    }

    /// Connect to the queue when configured; local workers re-run this
    /// executable with `config_file`
    pub async fn initialize(config: EngineConfig, config_file: Option<PathBuf>) -> Result<Self> {
        let queue = Arc::new(QueueManager::connect(&config).await);
        let launcher = WorkerLauncher::current_exe()?.with_config(config_file);
        Ok(Self::new(config, queue, launcher))
    }

    /// A context that never touches the queue, for processes that only
    /// execute workflows in-process
    pub fn offline(config: EngineConfig) -> Result<Self> {
        let queue = Arc::new(QueueManager::inert(config.queue.clone()));
        Ok(Self::new(config, queue, WorkerLauncher::current_exe()?))
    }
}

/// Entry point for configuring, running and observing one workflow
pub struct WorkflowManager {
    layout: WorkflowDir,
    definition: Arc<WorkflowDefinition>,
    params: Arc<ParameterManager>,
    files: Arc<FileManager>,
    executor: CommandExecutor,
    scheduler: Box<dyn Scheduler>,
}

impl WorkflowManager {
    /// Open the workflow described by `definition_path` in its directory
    /// under the workspace
    pub fn open(context: &EngineContext, definition_path: &Path) -> Result<Self> {
        let definition = WorkflowDefinition::load(definition_path)?;
        let layout = WorkflowDir::in_workspace(&context.config.workspace_dir, &definition.name);
        Self::build(context, layout, definition, definition_path)
    }

    /// Open a workflow at an explicit directory
    pub fn with_layout(context: &EngineContext, layout: WorkflowDir, definition_path: &Path) -> Result<Self> {
        let definition = WorkflowDefinition::load(definition_path)?;
        Self::build(context, layout, definition, definition_path)
    }

    fn build(
        context: &EngineContext,
        layout: WorkflowDir,
        definition: WorkflowDefinition,
        definition_path: &Path,
    ) -> Result<Self> {
        layout
            .ensure()
            .with_context(|| format!("Failed to create workflow directory {}", layout.root().display()))?;
        // Workers may run with another working directory
        let definition_path = std::fs::canonicalize(definition_path)
            .unwrap_or_else(|_| definition_path.to_path_buf());

        let params = Arc::new(ParameterManager::new(&layout, &context.config.presets_file)?);
        let files = Arc::new(FileManager::new(&layout)?);
        let logger = Arc::new(WorkflowLogger::new(&layout));
        let executor = CommandExecutor::new(
            Arc::clone(&logger),
            Arc::clone(&params),
            context.config.max_parallel,
        );

        let local = LocalScheduler::new(&layout, &definition_path, context.launcher.clone(), logger);
        let scheduler: Box<dyn Scheduler> = if context.queue.is_available() {
            Box::new(DistributedScheduler::new(Arc::clone(&context.queue), local))
        } else {
            Box::new(local)
        };
        tracing::debug!(
            "Opened workflow {} at {:?} ({} mode)",
            definition.name,
            layout.root(),
            scheduler.mode()
        );

        Ok(Self {
            layout,
            definition: Arc::new(definition),
            params,
            files,
            executor,
            scheduler,
        })
    }

    pub fn layout(&self) -> &WorkflowDir {
        &self.layout
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn parameters(&self) -> &Arc<ParameterManager> {
        &self.params
    }

    pub fn files(&self) -> &Arc<FileManager> {
        &self.files
    }

    pub fn logger(&self) -> &Arc<WorkflowLogger> {
        self.executor.logger()
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Mode chosen when the manager was created
    pub fn mode(&self) -> ExecutionMode {
        self.scheduler.mode()
    }

    /// Start a run in the background
    pub async fn start(&self) -> Result<ExecutionMode> {
        self.scheduler.start().await
    }

    pub async fn status(&self) -> WorkflowStatus {
        self.scheduler.status().await
    }

    pub async fn cancel(&self) -> Result<bool> {
        self.scheduler.cancel().await
    }

    /// Runner executing this workflow in the current process
    pub fn runner(&self) -> WorkflowRunner {
        WorkflowRunner::new(
            Arc::clone(&self.definition),
            Arc::clone(&self.params),
            Arc::clone(&self.files),
            self.executor.clone(),
        )
    }

    /// Execute the workflow here and now, as local and queue workers do
    pub async fn run_in_process(&self, progress: Arc<dyn ProgressSink>) -> RunReport {
        self.runner().run(progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::tests::PEAK_PICKING_YAML;
    use tempfile::TempDir;

    fn context(temp_dir: &TempDir) -> EngineContext {
        let config = EngineConfig {
            workspace_dir: temp_dir.path().join("workspace"),
            presets_file: temp_dir.path().join("presets.json"),
            ..EngineConfig::default()
        };
        EngineContext::offline(config).unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_workspace_directory() {
        let temp_dir = TempDir::new().unwrap();
        let definition = temp_dir.path().join("peak-picking.yaml");
        std::fs::write(&definition, PEAK_PICKING_YAML).unwrap();

        let manager = WorkflowManager::open(&context(&temp_dir), &definition).unwrap();
        assert_eq!(
            manager.layout().root(),
            temp_dir.path().join("workspace").join("peak-picking")
        );
        assert!(manager.layout().ini_dir().is_dir());
        assert_eq!(manager.mode(), ExecutionMode::Local);
        assert_eq!(manager.status().await.status, RunState::Idle);
        assert!(!manager.cancel().await.unwrap());
    }

    #[test]
    fn test_open_rejects_invalid_definition() {
        let temp_dir = TempDir::new().unwrap();
        let definition = temp_dir.path().join("broken.yaml");
        std::fs::write(&definition, "name: \"Broken\"\nsteps: []\n").unwrap();

        assert!(WorkflowManager::open(&context(&temp_dir), &definition).is_err());
    }
}

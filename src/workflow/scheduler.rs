// Workflow schedulers
//
// A run either executes as a detached local worker process or as a job on
// the distributed queue. Which one is decided once, when the workflow
// manager is created; both expose the same start/status/cancel surface.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Child;

use crate::executor::logger::{CANCEL_SENTINEL, ERROR_PREFIX, FINISH_SENTINEL, START_SENTINEL};
use crate::executor::{ProcessMarkers, Termination, WorkflowLogger};
use crate::error::QueueError;
use crate::queue::{JobInfo, JobPayload, JobSubmission, QueueManager, EXECUTE_WORKFLOW};
use crate::workflow::layout::{LogDetail, WorkflowDir};
use crate::workflow::types::{ExecutionMode, RunState, WorkflowStatus};

/// Start, observe and stop runs of one workflow
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Where runs started by this scheduler execute
    fn mode(&self) -> ExecutionMode;

    /// Start a run. Returns where it actually went.
    async fn start(&self) -> Result<ExecutionMode>;

    async fn status(&self) -> WorkflowStatus;

    /// Stop the current run. Returns whether anything was stopped.
    async fn cancel(&self) -> Result<bool>;
}

/// How to launch the local worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLauncher {
    pub program: PathBuf,
    /// Leading arguments before the worker subcommand's own
    pub args: Vec<String>,
    /// Configuration file handed to the worker
    pub config: Option<PathBuf>,
}

impl WorkerLauncher {
    /// Hidden subcommand of `msflow` that runs one workflow in-process
    pub const SUBCOMMAND: &'static str = "run-local";

    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            config: None,
        }
    }

    /// Re-invoke the running executable
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("Cannot locate the running executable")?;
        Ok(Self::new(program))
    }

    pub fn with_config(mut self, config: Option<PathBuf>) -> Self {
        self.config = config;
        self
    }

    /// Argument vector (without the program) for one run
    pub fn arguments(&self, layout: &WorkflowDir, definition: &Path) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(Self::SUBCOMMAND.to_string());
        args.push("--workflow-dir".to_string());
        args.push(layout.root().to_string_lossy().into_owned());
        args.push("--definition".to_string());
        args.push(definition.to_string_lossy().into_owned());
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.to_string_lossy().into_owned());
        }
        args
    }
}

/// Derive the state of a run without live processes from its minimal log
pub fn state_from_log(minimal_log: Option<&str>) -> RunState {
    let Some(log) = minimal_log.filter(|log| !log.trim().is_empty()) else {
        return RunState::Idle;
    };
    for line in log.lines().rev() {
        let line = line.trim();
        if line == FINISH_SENTINEL {
            return RunState::Finished;
        }
        if line == CANCEL_SENTINEL {
            return RunState::Canceled;
        }
        if line.starts_with(ERROR_PREFIX) || line == START_SENTINEL {
            return RunState::Failed;
        }
    }
    RunState::Failed
}

/// Runs workflows as detached child processes on this machine
#[derive(Debug)]
pub struct LocalScheduler {
    layout: WorkflowDir,
    definition: PathBuf,
    launcher: WorkerLauncher,
    logger: Arc<WorkflowLogger>,
    markers: ProcessMarkers,
    /// Worker started by this scheduler, reaped once it exits
    child: Mutex<Option<Child>>,
}

impl LocalScheduler {
    pub fn new(
        layout: &WorkflowDir,
        definition: &Path,
        launcher: WorkerLauncher,
        logger: Arc<WorkflowLogger>,
    ) -> Self {
        Self {
            layout: layout.clone(),
            definition: definition.to_path_buf(),
            launcher,
            logger,
            markers: ProcessMarkers::new(layout.pids_dir()),
            child: Mutex::new(None),
        }
    }

    pub fn markers(&self) -> &ProcessMarkers {
        &self.markers
    }

    fn is_running(&self) -> bool {
        {
            let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(running) = child.as_mut() {
                if !matches!(running.try_wait(), Ok(None)) {
                    *child = None;
                }
            }
        }
        self.markers.prune_dead();
        self.markers.any()
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Local
    }

    async fn start(&self) -> Result<ExecutionMode> {
        if self.is_running() {
            bail!("Workflow {} is already running", self.layout.name());
        }

        self.logger.clear().context("Failed to clear previous logs")?;
        self.markers.clear();
        crate::utils::remove_dir_if_exists(&self.layout.results_dir())
            .context("Failed to clear previous results")?;

        let mut command = tokio::process::Command::new(&self.launcher.program);
        command
            .args(self.launcher.arguments(&self.layout, &self.definition))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Keep terminal signals aimed at the caller away from the run
        #[cfg(unix)]
        command.process_group(0);
        let child = command
            .spawn()
            .with_context(|| format!("Failed to launch {}", self.launcher.program.display()))?;

        let pid = child.id().context("Worker process exited before it could be tracked")?;
        self.markers.touch(pid)?;
        tracing::info!("Started local run of {} as process {}", self.layout.name(), pid);
        *self.child.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);
        Ok(ExecutionMode::Local)
    }

    async fn status(&self) -> WorkflowStatus {
        if self.is_running() {
            return WorkflowStatus::local(RunState::Running);
        }
        let log = self.logger.read(LogDetail::Minimal);
        WorkflowStatus::local(state_from_log(log.as_deref()))
    }

    async fn cancel(&self) -> Result<bool> {
        let signaled = self.markers.terminate_all(Termination::Graceful);
        if signaled == 0 {
            return Ok(false);
        }
        self.logger.log(CANCEL_SENTINEL, LogDetail::Minimal);
        tracing::info!("Canceled {} ({} processes signaled)", self.layout.name(), signaled);
        Ok(true)
    }
}

/// Submits runs to the job queue, falling back to local execution when a
/// submission fails or the recorded job is gone
#[derive(Debug)]
pub struct DistributedScheduler {
    queue: Arc<QueueManager>,
    layout: WorkflowDir,
    definition: PathBuf,
    local: LocalScheduler,
}

/// What the store says about the job recorded in the workflow directory
#[derive(Debug)]
enum RecordedJob {
    None,
    Active(JobInfo),
    Done(JobInfo),
    /// The store could not be asked; the id is kept
    Unknown(String, QueueError),
}

impl DistributedScheduler {
    pub fn new(queue: Arc<QueueManager>, local: LocalScheduler) -> Self {
        Self {
            queue,
            layout: local.layout.clone(),
            definition: local.definition.clone(),
            local,
        }
    }

    /// Job id for a run started now
    pub fn job_id(layout: &WorkflowDir) -> String {
        format!("workflow-{}-{}", layout.name(), chrono::Utc::now().timestamp())
    }

    async fn recorded_job(&self) -> RecordedJob {
        let Some(job_id) = QueueManager::load_job_id(self.layout.root()) else {
            return RecordedJob::None;
        };
        match self.queue.get_job_info(&job_id).await {
            Ok(Some(info)) if RunState::from(info.status).is_active() => RecordedJob::Active(info),
            Ok(Some(info)) => RecordedJob::Done(info),
            Ok(None) => {
                tracing::debug!("Job {} is gone, forgetting it", job_id);
                QueueManager::clear_job_id(self.layout.root());
                RecordedJob::None
            }
            Err(e) => {
                tracing::debug!("Cannot look up job {}: {}", job_id, e);
                RecordedJob::Unknown(job_id, e)
            }
        }
    }
}

#[async_trait]
impl Scheduler for DistributedScheduler {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Queued
    }

    async fn start(&self) -> Result<ExecutionMode> {
        if self.local.is_running() {
            bail!("Workflow {} is already running locally", self.layout.name());
        }
        if let RecordedJob::Active(info) = self.recorded_job().await {
            bail!(
                "Workflow {} is already {} as job {}",
                self.layout.name(),
                RunState::from(info.status),
                info.job_id
            );
        }

        let payload = serde_json::to_value(JobPayload {
            workflow_dir: self.layout.root().to_path_buf(),
            definition: self.definition.clone(),
        })?;
        let submission = JobSubmission::new(EXECUTE_WORKFLOW, payload)
            .job_id(&Self::job_id(&self.layout))
            .description(&format!("Workflow {}", self.layout.name()));

        match self.queue.submit_job(submission).await {
            Some(job_id) => {
                QueueManager::store_job_id(self.layout.root(), &job_id)
                    .context("Failed to record the job id")?;
                Ok(ExecutionMode::Queued)
            }
            None => {
                tracing::warn!(
                    "Queue submission failed for {}, running locally",
                    self.layout.name()
                );
                // A previous job id would shadow the local run's status
                QueueManager::clear_job_id(self.layout.root());
                self.local.start().await
            }
        }
    }

    async fn status(&self) -> WorkflowStatus {
        if self.local.is_running() {
            return self.local.status().await;
        }
        match self.recorded_job().await {
            RecordedJob::Active(info) | RecordedJob::Done(info) => WorkflowStatus::from(info),
            RecordedJob::Unknown(job_id, e) => WorkflowStatus::unknown(&job_id, &e.to_string()),
            RecordedJob::None => self.local.status().await,
        }
    }

    async fn cancel(&self) -> Result<bool> {
        if self.local.is_running() {
            return self.local.cancel().await;
        }
        match self.recorded_job().await {
            RecordedJob::Active(info) => Ok(self.queue.cancel_job(&info.job_id).await),
            RecordedJob::Done(_) | RecordedJob::None => self.local.cancel().await,
            RecordedJob::Unknown(job_id, _) => {
                let queued = self.queue.cancel_job(&job_id).await;
                let local = self.local.cancel().await?;
                Ok(queued || local)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use tempfile::TempDir;

    #[test]
    fn test_state_from_log() {
        assert_eq!(state_from_log(None), RunState::Idle);
        assert_eq!(state_from_log(Some("")), RunState::Idle);
        assert_eq!(
            state_from_log(Some("STARTING WORKFLOW\nStep 1/1: pick\nWORKFLOW FINISHED\n")),
            RunState::Finished
        );
        assert_eq!(
            state_from_log(Some("STARTING WORKFLOW\nWORKFLOW CANCELED\n")),
            RunState::Canceled
        );
        assert_eq!(
            state_from_log(Some("STARTING WORKFLOW\nERROR: Step 'pick' failed\nCaused by...\n")),
            RunState::Failed
        );
        // Started, no live process, no terminal line: the worker died
        assert_eq!(state_from_log(Some("STARTING WORKFLOW\n")), RunState::Failed);
    }

    #[test]
    fn test_launcher_arguments() {
        let layout = WorkflowDir::new("/ws/demo");
        let launcher = WorkerLauncher::new("/usr/bin/msflow").with_config(Some("/etc/msflow.toml".into()));
        assert_eq!(
            launcher.arguments(&layout, Path::new("/defs/demo.yaml")),
            vec![
                "run-local",
                "--workflow-dir",
                "/ws/demo",
                "--definition",
                "/defs/demo.yaml",
                "--config",
                "/etc/msflow.toml"
            ]
        );
    }

    #[test]
    fn test_job_ids_name_the_workflow() {
        let id = DistributedScheduler::job_id(&WorkflowDir::new("/ws/demo"));
        assert!(id.starts_with("workflow-demo-"));
        assert!(id.rsplit('-').next().unwrap().parse::<i64>().is_ok());
    }

    fn local(temp_dir: &TempDir, program: &str, args: &[&str]) -> LocalScheduler {
        let layout = WorkflowDir::new(temp_dir.path().join("demo"));
        layout.ensure().unwrap();
        let mut launcher = WorkerLauncher::new(program);
        launcher.args = args.iter().map(|a| a.to_string()).collect();
        let logger = Arc::new(WorkflowLogger::new(&layout));
        LocalScheduler::new(&layout, Path::new("demo.yaml"), launcher, logger)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_start_status_cancel() {
        let temp_dir = TempDir::new().unwrap();
        // `sh -c 'sleep 30' run-local ...`: extra arguments become $0, $1, ...
        let scheduler = local(&temp_dir, "sh", &["-c", "sleep 30"]);

        assert_eq!(scheduler.status().await.status, RunState::Idle);
        assert_eq!(scheduler.start().await.unwrap(), ExecutionMode::Local);
        assert!(scheduler.status().await.running);
        assert!(scheduler.start().await.is_err());

        assert!(scheduler.cancel().await.unwrap());
        assert!(!scheduler.markers().any());
        let status = scheduler.status().await;
        assert_eq!(status.status, RunState::Canceled);
        assert!(!status.running);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreachable_store_keeps_job_id_until_local_start() {
        let temp_dir = TempDir::new().unwrap();
        let queue = Arc::new(QueueManager::inert(QueueSettings::default()));
        let scheduler =
            DistributedScheduler::new(queue, local(&temp_dir, "sh", &["-c", "sleep 30"]));
        let root = scheduler.layout.root().to_path_buf();

        QueueManager::store_job_id(&root, "workflow-demo-1").unwrap();
        // Nothing confirms the job is gone, so it is reported, not dropped
        let status = scheduler.status().await;
        assert_eq!(status.status, RunState::Unknown);
        assert_eq!(status.job_id.as_deref(), Some("workflow-demo-1"));
        assert!(status.error.is_some());
        assert_eq!(QueueManager::load_job_id(&root).as_deref(), Some("workflow-demo-1"));

        // Falling back to a local run forgets the stale job
        assert_eq!(scheduler.start().await.unwrap(), ExecutionMode::Local);
        assert!(QueueManager::load_job_id(&root).is_none());
        let status = scheduler.status().await;
        assert_eq!(status.status, RunState::Running);
        assert_eq!(status.mode, ExecutionMode::Local);
        assert!(scheduler.start().await.is_err());

        assert!(scheduler.cancel().await.unwrap());
        assert!(!scheduler.local.markers().any());
        assert_eq!(scheduler.status().await.status, RunState::Canceled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_reaches_local_run_behind_stale_job_id() {
        let temp_dir = TempDir::new().unwrap();
        let queue = Arc::new(QueueManager::inert(QueueSettings::default()));
        let scheduler =
            DistributedScheduler::new(queue, local(&temp_dir, "sh", &["-c", "sleep 30"]));
        let root = scheduler.layout.root().to_path_buf();

        scheduler.local.start().await.unwrap();
        QueueManager::store_job_id(&root, "workflow-demo-1").unwrap();

        assert!(scheduler.status().await.running);
        assert!(scheduler.cancel().await.unwrap());
        assert!(!scheduler.local.markers().any());
    }
}

// Workflow run state
//
// The normalized status shape shared by local and queued execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::queue::{JobInfo, JobStatus};

/// Where a workflow run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// A child process on this machine
    Local,
    /// A job on the distributed queue
    #[serde(alias = "online", alias = "distributed")]
    Queued,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Local => write!(f, "local"),
            ExecutionMode::Queued => write!(f, "queued"),
        }
    }
}

/// State of the latest run of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    /// Never started, or its traces were cleared
    Idle,
    /// Waiting on the queue
    Queued,
    Running,
    Finished,
    Failed,
    /// Held back by the queue
    Deferred,
    Canceled,
    /// A job is recorded but the queue backend cannot be reached
    Unknown,
}

impl RunState {
    /// Whether the run still occupies the workflow
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Queued | RunState::Running)
    }
}

impl From<JobStatus> for RunState {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued => RunState::Queued,
            JobStatus::Started => RunState::Running,
            JobStatus::Finished => RunState::Finished,
            JobStatus::Failed => RunState::Failed,
            JobStatus::Deferred => RunState::Deferred,
            JobStatus::Canceled => RunState::Canceled,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Finished => "finished",
            RunState::Failed => "failed",
            RunState::Deferred => "deferred",
            RunState::Canceled => "canceled",
            RunState::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Uniform status of a workflow, whichever way it runs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowStatus {
    pub running: bool,
    pub status: RunState,
    pub mode: ExecutionMode,
    /// 0..1; local runs only report 0 or 1
    pub progress: f64,
    pub current_step: String,
    pub job_id: Option<String>,
    /// 1-indexed position while queued
    pub queue_position: Option<usize>,
    pub queue_length: Option<usize>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl WorkflowStatus {
    /// Status of a local run
    pub fn local(status: RunState) -> Self {
        let (progress, current_step) = match status {
            RunState::Finished => (1.0, "Finished"),
            RunState::Running => (0.0, "Running"),
            RunState::Failed => (0.0, "Failed"),
            RunState::Canceled => (0.0, "Canceled"),
            _ => (0.0, ""),
        };
        Self {
            running: status.is_active(),
            status,
            mode: ExecutionMode::Local,
            progress,
            current_step: current_step.to_string(),
            job_id: None,
            queue_position: None,
            queue_length: None,
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
        }
    }

    /// Status of a recorded job the queue backend could not report on
    pub fn unknown(job_id: &str, error: &str) -> Self {
        Self {
            job_id: Some(job_id.to_string()),
            mode: ExecutionMode::Queued,
            current_step: "Job state unavailable".to_string(),
            error: Some(error.to_string()),
            ..Self::local(RunState::Unknown)
        }
    }
}

impl From<JobInfo> for WorkflowStatus {
    fn from(info: JobInfo) -> Self {
        let status = RunState::from(info.status);
        Self {
            running: status.is_active(),
            status,
            mode: ExecutionMode::Queued,
            progress: info.progress,
            current_step: info.current_step,
            job_id: Some(info.job_id),
            queue_position: info.queue_position,
            queue_length: info.queue_length,
            started_at: info.started_at,
            ended_at: info.ended_at,
            result: info.result,
            error: info.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: JobStatus) -> JobInfo {
        JobInfo {
            job_id: "workflow-demo-1".to_string(),
            status,
            progress: 0.4,
            current_step: "Executing workflow".to_string(),
            queue_position: None,
            queue_length: None,
            enqueued_at: None,
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
        }
    }

    #[test]
    fn test_started_job_is_running() {
        let status = WorkflowStatus::from(job(JobStatus::Started));
        assert!(status.running);
        assert_eq!(status.status, RunState::Running);
        assert_eq!(status.mode, ExecutionMode::Queued);
        assert_eq!(status.job_id.as_deref(), Some("workflow-demo-1"));
    }

    #[test]
    fn test_terminal_states_are_not_running() {
        for (job_status, state) in [
            (JobStatus::Finished, RunState::Finished),
            (JobStatus::Failed, RunState::Failed),
            (JobStatus::Canceled, RunState::Canceled),
            (JobStatus::Deferred, RunState::Deferred),
        ] {
            let status = WorkflowStatus::from(job(job_status));
            assert_eq!(status.status, state);
            assert!(!status.running);
        }
        assert!(WorkflowStatus::from(job(JobStatus::Queued)).running);
    }

    #[test]
    fn test_local_status_shape() {
        let finished = WorkflowStatus::local(RunState::Finished);
        assert_eq!(finished.progress, 1.0);
        assert!(!finished.running);
        assert_eq!(finished.mode, ExecutionMode::Local);

        let unknown = WorkflowStatus::unknown("workflow-demo-1", "queue backend is unavailable");
        assert_eq!(unknown.status.to_string(), "unknown");
        assert_eq!(unknown.mode, ExecutionMode::Queued);
        assert!(!unknown.running);

        let idle = WorkflowStatus::local(RunState::Idle);
        assert_eq!(idle.status.to_string(), "idle");
        assert!(idle.job_id.is_none());
    }
}

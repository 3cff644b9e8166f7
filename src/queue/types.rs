// Queue data types
//
// Normalized job and queue shapes returned to callers, independent of how
// the backing store encodes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Task name the worker dispatches workflow runs under
pub const EXECUTE_WORKFLOW: &str = "msflow.execute_workflow";

/// Lifecycle of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
    Deferred,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Deferred => "deferred",
            JobStatus::Canceled => "canceled",
        }
    }

    /// Map a stored status string; unknown values count as queued
    pub fn from_backend(value: &str) -> Self {
        match value {
            "started" => JobStatus::Started,
            "finished" => JobStatus::Finished,
            "failed" => JobStatus::Failed,
            "deferred" | "scheduled" => JobStatus::Deferred,
            "canceled" | "stopped" => JobStatus::Canceled,
            _ => JobStatus::Queued,
        }
    }

    /// No further transitions happen from this status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized view of one job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobInfo {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub current_step: String,
    /// 1-indexed, only while queued
    pub queue_position: Option<usize>,
    /// Only while queued
    pub queue_length: Option<usize>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Queue-wide counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub started: usize,
    pub finished: usize,
    pub failed: usize,
    pub workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    /// Store topology the queue runs on
    pub mode: String,
    /// Cluster state and node counts, cluster mode only
    #[serde(flatten)]
    pub details: BTreeMap<String, Value>,
}

/// Everything a worker needs to re-run a workflow from its directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub workflow_dir: PathBuf,
    /// Workflow definition to execute
    pub definition: PathBuf,
}

/// A job to enqueue
#[derive(Debug, Clone)]
pub struct JobSubmission {
    /// Task the worker dispatches on
    pub task: String,
    pub payload: Value,
    /// Explicit id, generated when `None`
    pub job_id: Option<String>,
    pub description: String,
    /// Overrides the configured job timeout
    pub timeout: Option<Duration>,
    /// Overrides the configured result retention
    pub result_ttl: Option<Duration>,
}

impl JobSubmission {
    pub fn new(task: &str, payload: Value) -> Self {
        Self {
            task: task.to_string(),
            payload,
            job_id: None,
            description: String::new(),
            timeout: None,
            result_ttl: None,
        }
    }

    pub fn job_id(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// A job claimed by a worker
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job_id: String,
    pub task: String,
    pub payload: Value,
    pub timeout: Duration,
    pub result_ttl: Duration,
}

/// Reachability of the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unavailable,
}

/// Store health: status and topology, plus fields specific to the topology
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreHealth {
    pub status: HealthStatus,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub details: BTreeMap<String, Value>,
}

impl StoreHealth {
    pub fn unavailable(mode: &str, error: Option<String>) -> Self {
        Self {
            status: HealthStatus::Unavailable,
            mode: mode.to_string(),
            error,
            details: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_normalization() {
        assert_eq!(JobStatus::from_backend("started"), JobStatus::Started);
        assert_eq!(JobStatus::from_backend("stopped"), JobStatus::Canceled);
        assert_eq!(JobStatus::from_backend("whatever"), JobStatus::Queued);
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Deferred.is_terminal());
        assert_eq!(JobStatus::Canceled.to_string(), "canceled");
    }

    #[test]
    fn test_health_flattens_details() {
        let mut health = StoreHealth::unavailable("cluster", None);
        health.status = HealthStatus::Healthy;
        health.details.insert("cluster_state".into(), json!("ok"));

        let value = serde_json::to_value(&health).unwrap();
        assert_eq!(
            value,
            json!({"status": "healthy", "mode": "cluster", "cluster_state": "ok"})
        );
    }
}

// Queue worker
//
// Pops jobs from the queue and runs each workflow in-process. Progress is
// written to the job record at fixed checkpoints, cancel requests are
// polled while the workflow runs, and the job timeout bounds every run.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::queue::{ClaimedJob, JobPayload, JobStatus, QueueManager, EXECUTE_WORKFLOW};
use crate::workflow::runner::Interrupt;
use crate::workflow::{EngineContext, ProgressSink, WorkflowDir, WorkflowManager};

/// Writes workflow progress into the job record
struct JobProgress {
    queue: Arc<QueueManager>,
    job_id: String,
}

#[async_trait]
impl ProgressSink for JobProgress {
    async fn report(&self, progress: f64, step: &str) {
        if let Err(e) = self.queue.update_progress(&self.job_id, progress, step).await {
            tracing::warn!("Failed to record progress of {}: {}", self.job_id, e);
        }
    }
}

/// A worker bound to one queue
pub struct QueueWorker {
    queue: Arc<QueueManager>,
    context: EngineContext,
    name: String,
    burst: bool,
}

impl QueueWorker {
    pub fn new(queue: Arc<QueueManager>, config: EngineConfig) -> Result<Self> {
        let name = format!(
            "{}-{}",
            std::process::id(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Ok(Self {
            context: EngineContext::offline(config)?,
            queue,
            name,
            burst: false,
        })
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Exit once the queue is empty instead of waiting for more jobs
    pub fn burst(mut self, burst: bool) -> Self {
        self.burst = burst;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process jobs until `shutdown` is set (checked between jobs and
    /// after every empty poll). Returns the number of jobs handled.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<usize> {
        let poll_interval = self.queue.settings().poll_interval;
        let mut handled = 0;
        tracing::info!(
            "Worker {} listening on queue {}",
            self.name,
            self.queue.settings().name
        );

        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.queue.heartbeat(&self.name, "idle", None).await {
                tracing::warn!("Heartbeat failed: {}", e);
            }

            match self.queue.pop_job(poll_interval).await {
                Ok(Some(job_id)) => {
                    match self.process_job(&job_id).await {
                        Ok(Some(status)) => tracing::info!("Job {} ended as {}", job_id, status),
                        Ok(None) => tracing::debug!("Job {} was no longer runnable", job_id),
                        Err(e) => tracing::error!("Job {} could not be recorded: {}", job_id, e),
                    }
                    handled += 1;
                }
                Ok(None) => {
                    if self.burst {
                        tracing::info!("Queue is empty, burst worker exiting");
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Polling the queue failed: {}", e);
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }

        if let Err(e) = self.queue.unregister_worker(&self.name).await {
            tracing::warn!("Failed to unregister worker {}: {}", self.name, e);
        }
        Ok(handled)
    }

    /// Claim and run one job. Returns its final status, or `None` when the
    /// job vanished or was canceled before it started.
    pub async fn process_job(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let Some(job) = self.queue.claim_job(job_id, &self.name).await? else {
            return Ok(None);
        };

        let status = match self.execute(&job).await {
            Ok((status, result, error)) => {
                self.queue
                    .finish_job(&job, status, Some(&result), error.as_deref())
                    .await?;
                status
            }
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!("Job {} failed before running: {}", job.job_id, message);
                self.queue
                    .finish_job(&job, JobStatus::Failed, None, Some(&message))
                    .await?;
                JobStatus::Failed
            }
        };
        Ok(Some(status))
    }

    async fn execute(&self, job: &ClaimedJob) -> Result<(JobStatus, serde_json::Value, Option<String>)> {
        if job.task != EXECUTE_WORKFLOW {
            anyhow::bail!("unknown task `{}`", job.task);
        }
        let payload: JobPayload = serde_json::from_value(job.payload.clone())?;
        tracing::info!("Running job {} for {:?}", job.job_id, payload.workflow_dir);

        let manager = WorkflowManager::with_layout(
            &self.context,
            WorkflowDir::new(&payload.workflow_dir),
            &payload.definition,
        )?;
        manager.logger().clear()?;

        let progress = Arc::new(JobProgress {
            queue: Arc::clone(&self.queue),
            job_id: job.job_id.clone(),
        });
        let stop = self.watch(job);
        let report = manager.runner().run_until(progress, stop).await;

        let status = if report.success {
            JobStatus::Finished
        } else if report.canceled {
            JobStatus::Canceled
        } else {
            JobStatus::Failed
        };
        let result = json!({
            "success": report.success,
            "workflow_dir": payload.workflow_dir,
        });
        Ok((status, result, report.error))
    }

    /// Resolves when the job is canceled or runs out of time. Each poll
    /// also renews the busy heartbeat that keeps the job's lease alive.
    async fn watch(&self, job: &ClaimedJob) -> Interrupt {
        let poll_interval = self.queue.settings().poll_interval;
        let deadline = tokio::time::sleep(job.timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Interrupt::TimedOut(job.timeout),
                _ = tokio::time::sleep(poll_interval) => {
                    if let Err(e) = self.queue.heartbeat(&self.name, "busy", Some(&job.job_id)).await {
                        tracing::debug!("Heartbeat for {} failed: {}", job.job_id, e);
                    }
                    match self.queue.is_cancel_requested(&job.job_id).await {
                        Ok(true) => {
                            tracing::info!("Job {} canceled on request", job.job_id);
                            return Interrupt::Canceled;
                        }
                        Ok(false) => {}
                        Err(e) => tracing::debug!("Cancel check for {} failed: {}", job.job_id, e),
                    }
                }
            }
        }
    }
}

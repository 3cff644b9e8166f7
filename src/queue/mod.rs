// Distributed job queue
//
// Jobs are hashes in the store; pending job ids wait in a list that workers
// pop from. Started/finished/failed registries are sorted sets scored by
// expiry time. Every key shares one hash tag so the whole queue lives in a
// single cluster slot and multi-key commands stay valid in cluster mode.

pub mod redis;
pub mod types;
pub mod worker;

pub use self::redis::{RedisConnection, RedisConnectionFactory};
pub use types::{
    ClaimedJob, HealthStatus, JobInfo, JobPayload, JobStatus, JobSubmission, QueueStats,
    StoreHealth, EXECUTE_WORKFLOW,
};

use ::redis::RedisError;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::config::{EngineConfig, QueueSettings, RedisMode};
use crate::error::QueueError;
use crate::workflow::WorkflowDir;

/// Hash tag shared by every queue key
const KEY_TAG: &str = "{msflow}";
/// How long a worker heartbeat stays valid
const WORKER_TTL: Duration = Duration::from_secs(60);
/// Slack past a started job's deadline before it counts as abandoned
const LEASE_GRACE: Duration = WORKER_TTL;

/// Fields of a job hash
mod field {
    pub const STATUS: &str = "status";
    pub const TASK: &str = "task";
    pub const PAYLOAD: &str = "payload";
    pub const DESCRIPTION: &str = "description";
    pub const TIMEOUT: &str = "timeout";
    pub const RESULT_TTL: &str = "result_ttl";
    pub const PROGRESS: &str = "progress";
    pub const CURRENT_STEP: &str = "current_step";
    pub const ENQUEUED_AT: &str = "enqueued_at";
    pub const STARTED_AT: &str = "started_at";
    pub const ENDED_AT: &str = "ended_at";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
    pub const CANCEL_REQUESTED: &str = "cancel_requested";
    pub const WORKER: &str = "worker";
}

/// Store keys for one queue name
#[derive(Debug, Clone)]
struct QueueKeys {
    pending: String,
    started: String,
    finished: String,
    failed: String,
    workers: String,
}

impl QueueKeys {
    fn new(queue: &str) -> Self {
        let prefix = format!("{}:queue:{}", KEY_TAG, queue);
        Self {
            pending: format!("{}:pending", prefix),
            started: format!("{}:started", prefix),
            finished: format!("{}:finished", prefix),
            failed: format!("{}:failed", prefix),
            workers: format!("{}:workers", prefix),
        }
    }

    fn job(&self, job_id: &str) -> String {
        format!("{}:job:{}", KEY_TAG, job_id)
    }

    fn worker(&self, name: &str) -> String {
        format!("{}:worker:{}", KEY_TAG, name)
    }
}

fn now_secs() -> i64 {
    Utc::now().timestamp()
}

fn parse_time(value: Option<&String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// Job queue client; inert when no store is configured or reachable
#[derive(Debug)]
pub struct QueueManager {
    factory: Option<RedisConnectionFactory>,
    settings: QueueSettings,
    keys: QueueKeys,
}

impl QueueManager {
    /// A manager that never queues anything
    pub fn inert(settings: QueueSettings) -> Self {
        let keys = QueueKeys::new(&settings.name);
        Self {
            factory: None,
            settings,
            keys,
        }
    }

    /// Connect when the configuration describes an online deployment.
    ///
    /// An unreachable store is logged and yields an inert manager.
    pub async fn connect(config: &EngineConfig) -> Self {
        let Some(redis) = config.store_config() else {
            tracing::debug!("No store configured, queued execution disabled");
            return Self::inert(config.queue.clone());
        };

        let factory = RedisConnectionFactory::new(redis.clone());
        match factory.get_connection().await {
            Ok(_) => {
                let keys = QueueKeys::new(&config.queue.name);
                Self {
                    factory: Some(factory),
                    settings: config.queue.clone(),
                    keys,
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Store unreachable ({} mode), running workflows locally: {}",
                    redis.mode,
                    e
                );
                Self::inert(config.queue.clone())
            }
        }
    }

    /// Whether jobs can be submitted
    pub fn is_available(&self) -> bool {
        self.factory.is_some()
    }

    /// Connection factory of the store, when one is in use
    pub fn factory(&self) -> Option<&RedisConnectionFactory> {
        self.factory.as_ref()
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn redis_mode(&self) -> Option<RedisMode> {
        self.factory.as_ref().map(|factory| factory.mode())
    }

    /// Store health; `unavailable` when no store is in use
    pub async fn get_store_health(&self) -> StoreHealth {
        match &self.factory {
            Some(factory) => factory.get_health().await,
            None => StoreHealth::unavailable("none", Some("queue backend is not configured".to_string())),
        }
    }

    async fn conn(&self) -> Result<RedisConnection, QueueError> {
        let factory = self.factory.as_ref().ok_or(QueueError::Unavailable)?;
        factory.get_connection().await
    }

    /// Drop the connection after transport errors so the next call
    /// reconnects (and, with sentinels, finds the current primary)
    async fn observe(&self, error: &QueueError) {
        if let (Some(factory), QueueError::Redis(e)) = (&self.factory, error) {
            if is_transport_error(e) {
                factory.invalidate().await;
            }
        }
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T, QueueError>
    where
        F: FnOnce(RedisConnection) -> Fut,
        Fut: std::future::Future<Output = Result<T, QueueError>>,
    {
        let connection = self.conn().await?;
        let result = op(connection).await;
        if let Err(e) = &result {
            self.observe(e).await;
        }
        result
    }

    /// Enqueue a job. Returns its id, or `None` when the queue is
    /// unavailable or the submission failed.
    pub async fn submit_job(&self, submission: JobSubmission) -> Option<String> {
        if !self.is_available() {
            return None;
        }
        match self.try_submit(submission).await {
            Ok(job_id) => {
                tracing::info!("Submitted job {}", job_id);
                Some(job_id)
            }
            Err(e) => {
                tracing::warn!("Job submission failed: {}", e);
                None
            }
        }
    }

    async fn try_submit(&self, submission: JobSubmission) -> Result<String, QueueError> {
        let job_id = submission
            .job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let job_key = self.keys.job(&job_id);
        let pending = self.keys.pending.clone();
        let timeout = submission.timeout.unwrap_or(self.settings.job_timeout);
        let result_ttl = submission.result_ttl.unwrap_or(self.settings.result_ttl);
        let payload = serde_json::to_string(&submission.payload)?;

        self.run(|mut conn| async move {
            let _: () = ::redis::pipe()
                .cmd("DEL")
                .arg(&job_key)
                .ignore()
                .cmd("HSET")
                .arg(&job_key)
                .arg(field::STATUS)
                .arg(JobStatus::Queued.as_str())
                .arg(field::TASK)
                .arg(&submission.task)
                .arg(field::PAYLOAD)
                .arg(&payload)
                .arg(field::DESCRIPTION)
                .arg(&submission.description)
                .arg(field::TIMEOUT)
                .arg(timeout.as_secs())
                .arg(field::RESULT_TTL)
                .arg(result_ttl.as_secs())
                .arg(field::PROGRESS)
                .arg(0.0)
                .arg(field::CURRENT_STEP)
                .arg("Queued")
                .arg(field::ENQUEUED_AT)
                .arg(now_secs())
                .ignore()
                .cmd("RPUSH")
                .arg(&pending)
                .arg(&job_id)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok::<_, QueueError>(job_id)
        })
        .await
    }

    /// Normalized job state. `Ok(None)` only when the store confirms the
    /// job is unknown (or expired); transport failures are errors.
    ///
    /// A started job whose lease ran out is failed here as abandoned.
    pub async fn get_job_info(&self, job_id: &str) -> Result<Option<JobInfo>, QueueError> {
        let job_key = self.keys.job(job_id);
        let keys = self.keys.clone();
        let pending = self.keys.pending.clone();
        let job_id = job_id.to_string();
        let result_ttl = self.settings.result_ttl;

        self.run(|mut conn| async move {
            let fields: HashMap<String, String> =
                ::redis::cmd("HGETALL").arg(&job_key).query_async(&mut conn).await?;
            if fields.is_empty() {
                return Ok(None);
            }

            let mut status = JobStatus::from_backend(
                fields.get(field::STATUS).map(String::as_str).unwrap_or(""),
            );
            let mut error = fields.get(field::ERROR).cloned();
            let mut ended_at = parse_time(fields.get(field::ENDED_AT));
            if status == JobStatus::Started {
                if let Some(reason) = fail_if_abandoned(&mut conn, &keys, &job_id, &fields, result_ttl).await? {
                    status = JobStatus::Failed;
                    error = Some(reason);
                    ended_at = Utc.timestamp_opt(now_secs(), 0).single();
                }
            }

            let (queue_position, queue_length) = if status == JobStatus::Queued {
                let ids: Vec<String> =
                    ::redis::cmd("LRANGE").arg(&pending).arg(0).arg(-1).query_async(&mut conn).await?;
                let position = ids.iter().position(|id| *id == job_id).map(|i| i + 1);
                (position, Some(ids.len()))
            } else {
                (None, None)
            };

            Ok::<_, QueueError>(Some(JobInfo {
                job_id,
                status,
                progress: fields
                    .get(field::PROGRESS)
                    .and_then(|p| p.parse::<f64>().ok())
                    .unwrap_or(0.0)
                    .clamp(0.0, 1.0),
                current_step: fields.get(field::CURRENT_STEP).cloned().unwrap_or_default(),
                queue_position,
                queue_length,
                enqueued_at: parse_time(fields.get(field::ENQUEUED_AT)),
                started_at: parse_time(fields.get(field::STARTED_AT)),
                ended_at,
                result: fields
                    .get(field::RESULT)
                    .and_then(|raw| serde_json::from_str::<Value>(raw).ok()),
                error,
            }))
        })
        .await
    }

    /// Cancel a job: a queued job is removed from the queue, a started job
    /// is asked to stop. Returns whether the job existed and was not
    /// already finished.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        match self.try_cancel(job_id).await {
            Ok(canceled) => canceled,
            Err(e) => {
                tracing::warn!("Failed to cancel job {}: {}", job_id, e);
                false
            }
        }
    }

    async fn try_cancel(&self, job_id: &str) -> Result<bool, QueueError> {
        let job_key = self.keys.job(job_id);
        let keys = self.keys.clone();
        let job_id = job_id.to_string();
        let result_ttl = self.settings.result_ttl;

        self.run(|mut conn| async move {
            let status: Option<String> =
                ::redis::cmd("HGET").arg(&job_key).arg(field::STATUS).query_async(&mut conn).await?;
            let Some(status) = status.map(|s| JobStatus::from_backend(&s)) else {
                return Ok(false);
            };
            if status.is_terminal() {
                return Ok(false);
            }

            let mut pipe = ::redis::pipe();
            pipe.cmd("HSET")
                .arg(&job_key)
                .arg(field::CANCEL_REQUESTED)
                .arg(1)
                .ignore();
            if status != JobStatus::Started {
                pipe.cmd("LREM")
                    .arg(&keys.pending)
                    .arg(0)
                    .arg(&job_id)
                    .ignore()
                    .cmd("HSET")
                    .arg(&job_key)
                    .arg(field::STATUS)
                    .arg(JobStatus::Canceled.as_str())
                    .arg(field::ENDED_AT)
                    .arg(now_secs())
                    .ignore()
                    .cmd("EXPIRE")
                    .arg(&job_key)
                    .arg(result_ttl.as_secs())
                    .ignore();
            }
            let _: () = pipe.query_async(&mut conn).await?;
            tracing::info!("Cancel requested for job {}", job_id);
            Ok::<_, QueueError>(true)
        })
        .await
    }

    /// Queue counters, `None` when the queue is unavailable
    pub async fn get_queue_stats(&self) -> Option<QueueStats> {
        if !self.is_available() {
            return None;
        }
        match self.try_stats().await {
            Ok(mut stats) => {
                if let Some(factory) = &self.factory {
                    stats.mode = factory.mode().to_string();
                    if factory.mode() == RedisMode::Cluster {
                        let health = factory.get_health().await;
                        for key in ["cluster_state", "cluster_known_nodes", "master_nodes", "replica_nodes"] {
                            if let Some(value) = health.details.get(key) {
                                stats.details.insert(key.to_string(), value.clone());
                            }
                        }
                    }
                }
                Some(stats)
            }
            Err(e) => {
                tracing::warn!("Failed to read queue stats: {}", e);
                None
            }
        }
    }

    async fn try_stats(&self) -> Result<QueueStats, QueueError> {
        let keys = self.keys.clone();
        let result_ttl = self.settings.result_ttl;
        self.run(|mut conn| async move {
            let now = now_secs();
            let mut stats = QueueStats {
                queued: ::redis::cmd("LLEN").arg(&keys.pending).query_async(&mut conn).await?,
                ..QueueStats::default()
            };

            // Started jobs leave the registry by finishing or by being
            // failed as abandoned, never by plain expiry
            let started: Vec<String> =
                ::redis::cmd("ZRANGE").arg(&keys.started).arg(0).arg(-1).query_async(&mut conn).await?;
            for job_id in started {
                let fields: HashMap<String, String> =
                    ::redis::cmd("HGETALL").arg(keys.job(&job_id)).query_async(&mut conn).await?;
                let status = JobStatus::from_backend(
                    fields.get(field::STATUS).map(String::as_str).unwrap_or(""),
                );
                if status == JobStatus::Started {
                    fail_if_abandoned(&mut conn, &keys, &job_id, &fields, result_ttl).await?;
                } else {
                    let _: () = ::redis::cmd("ZREM")
                        .arg(&keys.started)
                        .arg(&job_id)
                        .query_async(&mut conn)
                        .await?;
                }
            }
            stats.started = ::redis::cmd("ZCARD").arg(&keys.started).query_async(&mut conn).await?;

            for (registry, slot) in [
                (&keys.finished, &mut stats.finished),
                (&keys.failed, &mut stats.failed),
            ] {
                let _: () = ::redis::cmd("ZREMRANGEBYSCORE")
                    .arg(registry)
                    .arg("-inf")
                    .arg(now)
                    .query_async(&mut conn)
                    .await?;
                *slot = ::redis::cmd("ZCARD").arg(registry).query_async(&mut conn).await?;
            }

            let workers: Vec<String> =
                ::redis::cmd("SMEMBERS").arg(&keys.workers).query_async(&mut conn).await?;
            for name in workers {
                let state: Option<String> = ::redis::cmd("HGET")
                    .arg(keys.worker(&name))
                    .arg("state")
                    .query_async(&mut conn)
                    .await?;
                match state.as_deref() {
                    None => {
                        let _: () = ::redis::cmd("SREM")
                            .arg(&keys.workers)
                            .arg(&name)
                            .query_async(&mut conn)
                            .await?;
                    }
                    Some("busy") => stats.busy_workers += 1,
                    Some(_) => stats.idle_workers += 1,
                }
            }
            stats.workers = stats.busy_workers + stats.idle_workers;
            Ok::<_, QueueError>(stats)
        })
        .await
    }

    /// Persist the id of a submitted job in the workflow directory
    pub fn store_job_id(workflow_dir: &Path, job_id: &str) -> std::io::Result<()> {
        crate::utils::write_atomic(&WorkflowDir::new(workflow_dir).job_id_file(), job_id.as_bytes())
    }

    /// The recorded job id, if any
    pub fn load_job_id(workflow_dir: &Path) -> Option<String> {
        std::fs::read_to_string(WorkflowDir::new(workflow_dir).job_id_file())
            .ok()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
    }

    pub fn clear_job_id(workflow_dir: &Path) {
        let _ = std::fs::remove_file(WorkflowDir::new(workflow_dir).job_id_file());
    }

    // Worker side

    /// Wait up to `timeout` for the next pending job id
    pub async fn pop_job(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let pending = self.keys.pending.clone();
        self.run(|mut conn| async move {
            let popped: Option<(String, String)> = ::redis::cmd("BLPOP")
                .arg(&pending)
                .arg(timeout.as_secs_f64().max(0.01))
                .query_async(&mut conn)
                .await?;
            Ok::<_, QueueError>(popped.map(|(_, job_id)| job_id))
        })
        .await
    }

    /// Mark a popped job as started by `worker`. Returns `None` when the
    /// job vanished or was canceled while queued.
    pub async fn claim_job(&self, job_id: &str, worker: &str) -> Result<Option<ClaimedJob>, QueueError> {
        let job_key = self.keys.job(job_id);
        let started = self.keys.started.clone();
        let workers = self.keys.workers.clone();
        let worker_key = self.keys.worker(worker);
        let job_id = job_id.to_string();
        let worker = worker.to_string();
        let defaults = self.settings.clone();

        self.run(|mut conn| async move {
            let fields: HashMap<String, String> =
                ::redis::cmd("HGETALL").arg(&job_key).query_async(&mut conn).await?;
            if fields.is_empty() {
                return Ok(None);
            }
            let status = JobStatus::from_backend(fields.get(field::STATUS).map(String::as_str).unwrap_or(""));
            if status != JobStatus::Queued || fields.contains_key(field::CANCEL_REQUESTED) {
                return Ok(None);
            }

            let secs = |name: &str, default: Duration| {
                fields
                    .get(name)
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(default)
            };
            let timeout = secs(field::TIMEOUT, defaults.job_timeout);
            let result_ttl = secs(field::RESULT_TTL, defaults.result_ttl);
            let payload: Value = serde_json::from_str(
                fields.get(field::PAYLOAD).map(String::as_str).unwrap_or("null"),
            )?;

            let now = now_secs();
            let _: () = ::redis::pipe()
                .cmd("HSET")
                .arg(&job_key)
                .arg(field::STATUS)
                .arg(JobStatus::Started.as_str())
                .arg(field::STARTED_AT)
                .arg(now)
                .arg(field::WORKER)
                .arg(&worker)
                .ignore()
                .cmd("ZADD")
                .arg(&started)
                .arg(now + timeout.as_secs() as i64)
                .arg(&job_id)
                .ignore()
                // The worker's busy record is the job's lease
                .cmd("SADD")
                .arg(&workers)
                .arg(&worker)
                .ignore()
                .cmd("HSET")
                .arg(&worker_key)
                .arg("state")
                .arg("busy")
                .arg("current_job")
                .arg(&job_id)
                .arg("last_heartbeat")
                .arg(now)
                .ignore()
                .cmd("EXPIRE")
                .arg(&worker_key)
                .arg(WORKER_TTL.as_secs())
                .ignore()
                .query_async(&mut conn)
                .await?;

            Ok::<_, QueueError>(Some(ClaimedJob {
                task: fields.get(field::TASK).cloned().unwrap_or_default(),
                job_id,
                payload,
                timeout,
                result_ttl,
            }))
        })
        .await
    }

    /// Record progress (0..1) and a short step label
    pub async fn update_progress(&self, job_id: &str, progress: f64, step: &str) -> Result<(), QueueError> {
        let job_key = self.keys.job(job_id);
        let step = step.to_string();
        self.run(|mut conn| async move {
            let _: () = ::redis::cmd("HSET")
                .arg(&job_key)
                .arg(field::PROGRESS)
                .arg(progress.clamp(0.0, 1.0))
                .arg(field::CURRENT_STEP)
                .arg(&step)
                .query_async(&mut conn)
                .await?;
            Ok::<_, QueueError>(())
        })
        .await
    }

    /// Whether someone asked for the job to stop
    pub async fn is_cancel_requested(&self, job_id: &str) -> Result<bool, QueueError> {
        let job_key = self.keys.job(job_id);
        self.run(|mut conn| async move {
            let flag: Option<String> = ::redis::cmd("HGET")
                .arg(&job_key)
                .arg(field::CANCEL_REQUESTED)
                .query_async(&mut conn)
                .await?;
            Ok::<_, QueueError>(flag.is_some())
        })
        .await
    }

    /// Move a started job into a terminal state and schedule its expiry
    pub async fn finish_job(
        &self,
        job: &ClaimedJob,
        status: JobStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), QueueError> {
        let job_key = self.keys.job(&job.job_id);
        let registry = match status {
            JobStatus::Finished => Some(self.keys.finished.clone()),
            JobStatus::Failed => Some(self.keys.failed.clone()),
            _ => None,
        };
        let started = self.keys.started.clone();
        let job_id = job.job_id.clone();
        let ttl = job.result_ttl.as_secs();
        let result = result.map(serde_json::to_string).transpose()?;
        let error = error.map(String::from);

        self.run(|mut conn| async move {
            let now = now_secs();
            let mut pipe = ::redis::pipe();
            pipe.cmd("HSET")
                .arg(&job_key)
                .arg(field::STATUS)
                .arg(status.as_str())
                .arg(field::ENDED_AT)
                .arg(now)
                .ignore();
            if status == JobStatus::Finished {
                pipe.cmd("HSET")
                    .arg(&job_key)
                    .arg(field::PROGRESS)
                    .arg(1.0)
                    .ignore();
            }
            if let Some(result) = &result {
                pipe.cmd("HSET").arg(&job_key).arg(field::RESULT).arg(result).ignore();
            }
            if let Some(error) = &error {
                pipe.cmd("HSET").arg(&job_key).arg(field::ERROR).arg(error).ignore();
            }
            pipe.cmd("ZREM").arg(&started).arg(&job_id).ignore();
            if let Some(registry) = &registry {
                pipe.cmd("ZADD")
                    .arg(registry)
                    .arg(now + ttl as i64)
                    .arg(&job_id)
                    .ignore();
            }
            pipe.cmd("EXPIRE").arg(&job_key).arg(ttl.max(1)).ignore();
            let _: () = pipe.query_async(&mut conn).await?;
            Ok::<_, QueueError>(())
        })
        .await
    }

    /// Publish a worker heartbeat with its current state
    pub async fn heartbeat(&self, worker: &str, state: &str, current_job: Option<&str>) -> Result<(), QueueError> {
        let workers = self.keys.workers.clone();
        let worker_key = self.keys.worker(worker);
        let worker = worker.to_string();
        let state = state.to_string();
        let current_job = current_job.unwrap_or("").to_string();

        self.run(|mut conn| async move {
            let _: () = ::redis::pipe()
                .cmd("SADD")
                .arg(&workers)
                .arg(&worker)
                .ignore()
                .cmd("HSET")
                .arg(&worker_key)
                .arg("state")
                .arg(&state)
                .arg("current_job")
                .arg(&current_job)
                .arg("last_heartbeat")
                .arg(now_secs())
                .ignore()
                .cmd("EXPIRE")
                .arg(&worker_key)
                .arg(WORKER_TTL.as_secs())
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok::<_, QueueError>(())
        })
        .await
    }

    /// Remove a worker's registration
    pub async fn unregister_worker(&self, worker: &str) -> Result<(), QueueError> {
        let workers = self.keys.workers.clone();
        let worker_key = self.keys.worker(worker);
        let worker = worker.to_string();
        self.run(|mut conn| async move {
            let _: () = ::redis::pipe()
                .cmd("SREM")
                .arg(&workers)
                .arg(&worker)
                .ignore()
                .cmd("DEL")
                .arg(&worker_key)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok::<_, QueueError>(())
        })
        .await
    }
}

/// Why a started job counts as abandoned, if it does. `worker_job` is the
/// job named in the worker's heartbeat, `None` once the heartbeat expired.
fn abandonment(
    now: i64,
    deadline: Option<i64>,
    job_id: &str,
    worker: Option<&str>,
    worker_job: Option<&str>,
) -> Option<String> {
    if let Some(deadline) = deadline {
        if now > deadline + LEASE_GRACE.as_secs() as i64 {
            return Some(format!(
                "job abandoned: no result {} seconds after its deadline",
                now - deadline
            ));
        }
    }
    let worker = worker?;
    match worker_job {
        None => Some(format!("job abandoned: worker {} stopped sending heartbeats", worker)),
        Some(current) if current != job_id => Some(format!(
            "job abandoned: worker {} moved on without recording a result",
            worker
        )),
        Some(_) => None,
    }
}

/// Fail a started job whose lease ran out. Returns the recorded error.
async fn fail_if_abandoned(
    conn: &mut RedisConnection,
    keys: &QueueKeys,
    job_id: &str,
    fields: &HashMap<String, String>,
    default_ttl: Duration,
) -> Result<Option<String>, QueueError> {
    let deadline: Option<f64> = ::redis::cmd("ZSCORE")
        .arg(&keys.started)
        .arg(job_id)
        .query_async(&mut *conn)
        .await?;
    let worker = fields.get(field::WORKER).filter(|w| !w.is_empty());
    let worker_job: Option<String> = match worker {
        Some(worker) => {
            ::redis::cmd("HGET")
                .arg(keys.worker(worker))
                .arg("current_job")
                .query_async(&mut *conn)
                .await?
        }
        None => None,
    };

    let Some(reason) = abandonment(
        now_secs(),
        deadline.map(|d| d as i64),
        job_id,
        worker.map(String::as_str),
        worker_job.as_deref(),
    ) else {
        return Ok(None);
    };

    let ttl = fields
        .get(field::RESULT_TTL)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_ttl.as_secs())
        .max(1);
    let now = now_secs();
    let job_key = keys.job(job_id);
    let _: () = ::redis::pipe()
        .cmd("HSET")
        .arg(&job_key)
        .arg(field::STATUS)
        .arg(JobStatus::Failed.as_str())
        .arg(field::ENDED_AT)
        .arg(now)
        .arg(field::ERROR)
        .arg(&reason)
        .ignore()
        .cmd("ZREM")
        .arg(&keys.started)
        .arg(job_id)
        .ignore()
        .cmd("ZADD")
        .arg(&keys.failed)
        .arg(now + ttl as i64)
        .arg(job_id)
        .ignore()
        .cmd("EXPIRE")
        .arg(&job_key)
        .arg(ttl)
        .ignore()
        .query_async(&mut *conn)
        .await?;
    tracing::warn!("Job {} failed: {}", job_id, reason);
    Ok(Some(reason))
}

fn is_transport_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_keys_share_one_slot() {
        let keys = QueueKeys::new("msflow-workflows");
        for key in [
            keys.pending.clone(),
            keys.started.clone(),
            keys.workers.clone(),
            keys.job("workflow-demo-1"),
            keys.worker("w1"),
        ] {
            assert!(key.starts_with("{msflow}:"), "{key}");
        }
    }

    #[test]
    fn test_inert_queue_never_submits() {
        let queue = QueueManager::inert(QueueSettings::default());
        assert!(!queue.is_available());
        assert!(queue.redis_mode().is_none());

        tokio_test::block_on(async {
            let submitted = queue
                .submit_job(JobSubmission::new(EXECUTE_WORKFLOW, json!({})))
                .await;
            assert!(submitted.is_none());
            assert!(matches!(
                queue.get_job_info("anything").await,
                Err(QueueError::Unavailable)
            ));
            assert!(!queue.cancel_job("anything").await);
            assert!(queue.get_queue_stats().await.is_none());
            assert_eq!(queue.get_store_health().await.status, HealthStatus::Unavailable);
        });
    }

    #[tokio::test]
    async fn test_unreachable_store_yields_inert_queue() {
        let mut config = EngineConfig::default();
        config.online_deployment = true;
        config.redis = Some(RedisConfig {
            url: "redis://127.0.0.1:1/0".to_string(),
            connect_timeout: Duration::from_millis(500),
            ..RedisConfig::default()
        });

        let queue = QueueManager::connect(&config).await;
        assert!(!queue.is_available());
        assert!(queue
            .submit_job(JobSubmission::new(EXECUTE_WORKFLOW, json!({})))
            .await
            .is_none());
    }

    #[test]
    fn test_job_id_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(QueueManager::load_job_id(temp_dir.path()).is_none());

        QueueManager::store_job_id(temp_dir.path(), "workflow-demo-1700000000").unwrap();
        assert!(WorkflowDir::new(temp_dir.path()).job_id_file().is_file());
        assert_eq!(
            QueueManager::load_job_id(temp_dir.path()).as_deref(),
            Some("workflow-demo-1700000000")
        );

        QueueManager::clear_job_id(temp_dir.path());
        assert!(QueueManager::load_job_id(temp_dir.path()).is_none());
    }

    #[test]
    fn test_started_job_keeps_lease_while_worker_reports_it() {
        let now = 10_000;
        assert_eq!(abandonment(now, Some(now + 60), "job-1", Some("w1"), Some("job-1")), None);
        // Within the grace period after the deadline the worker may still finish
        assert_eq!(abandonment(now, Some(now - 10), "job-1", Some("w1"), Some("job-1")), None);
        // Jobs claimed without a worker name only expire by deadline
        assert_eq!(abandonment(now, Some(now - 10), "job-1", None, None), None);
    }

    #[test]
    fn test_started_job_abandoned() {
        let now = 10_000;
        let grace = LEASE_GRACE.as_secs() as i64;

        let late = abandonment(now, Some(now - grace - 1), "job-1", Some("w1"), Some("job-1")).unwrap();
        assert!(late.contains("after its deadline"), "{late}");

        let silent = abandonment(now, Some(now + 60), "job-1", Some("w1"), None).unwrap();
        assert!(silent.contains("stopped sending heartbeats"), "{silent}");

        let moved_on = abandonment(now, None, "job-1", Some("w1"), Some("")).unwrap();
        assert!(moved_on.contains("moved on"), "{moved_on}");
        assert!(abandonment(now, None, "job-1", Some("w1"), Some("job-2")).is_some());
    }
}

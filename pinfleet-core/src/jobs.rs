//! Provider-side job serializer: a FIFO queue that executes pin, unpin,
//! and contract-acceptance work strictly one job at a time, so concurrent
//! mutations of the local storage repository are impossible by
//! construction.

use crate::config::JobQueueConfig;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Pin,
    Unpin,
    AcceptContract,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// What a job does, with its natural completion key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSpec {
    Pin { cid: String },
    Unpin { cid: String },
    AcceptContract { contract_id: String },
}

impl JobSpec {
    pub fn job_type(&self) -> JobType {
        match self {
            JobSpec::Pin { .. } => JobType::Pin,
            JobSpec::Unpin { .. } => JobType::Unpin,
            JobSpec::AcceptContract { .. } => JobType::AcceptContract,
        }
    }

    /// Key the completion signal is correlated on.
    pub fn completion_key(&self) -> &str {
        match self {
            JobSpec::Pin { cid } | JobSpec::Unpin { cid } => cid,
            JobSpec::AcceptContract { contract_id } => contract_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub added_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

pub type CompletionResult = std::result::Result<(), String>;

/// Correlates asynchronous completion signals with the job waiting on
/// them, keyed by the job's natural key. Signals for unknown keys are
/// dropped.
#[derive(Clone, Default)]
pub struct CompletionBoard {
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<CompletionResult>>>>,
}

impl CompletionBoard {
    /// Deliver a completion signal. Returns false when nothing was
    /// waiting on `key` (unknown key, or the job already timed out).
    pub fn complete(&self, key: &str, result: CompletionResult) -> bool {
        let sender = self.waiters.lock().unwrap().remove(key);
        match sender {
            Some(sender) => sender.send(result).is_ok(),
            None => {
                tracing::debug!("Dropping completion signal for unknown key {}", key);
                false
            }
        }
    }

    fn register(&self, key: &str) -> oneshot::Receiver<CompletionResult> {
        let (sender, receiver) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .insert(key.to_string(), sender);
        receiver
    }

    fn cancel(&self, key: &str) {
        self.waiters.lock().unwrap().remove(key);
    }
}

/// Starts the actual work for a job. Completion is signalled separately
/// through the [`CompletionBoard`] under the job's completion key.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn start(&self, job: &Job) -> Result<()>;
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Job>,
    active: Option<Job>,
    history: Vec<Job>,
}

impl QueueState {
    fn pop_next(&mut self) -> Option<Job> {
        let mut job = self.queue.pop_front()?;
        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now());
        self.active = Some(job.clone());
        Some(job)
    }
}

struct QueueInner {
    config: JobQueueConfig,
    executor: Arc<dyn JobExecutor>,
    board: CompletionBoard,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl QueueInner {
    fn timeout_for(&self, job_type: JobType) -> Duration {
        let secs = match job_type {
            JobType::Pin => self.config.pin_timeout_secs,
            JobType::Unpin => self.config.unpin_timeout_secs,
            JobType::AcceptContract => self.config.contract_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

pub struct JobQueue {
    inner: Arc<QueueInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn spawn(
        executor: Arc<dyn JobExecutor>,
        config: JobQueueConfig,
        board: CompletionBoard,
    ) -> Self {
        let inner = Arc::new(QueueInner {
            config,
            executor,
            board,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        });
        let worker = tokio::spawn(worker_loop(inner.clone()));

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Append a job. A second job with the same id while the first one is
    /// still queued or processing is a no-op; returns whether the job was
    /// accepted.
    pub fn add_job(&self, job_id: &str, spec: JobSpec) -> bool {
        let mut state = self.inner.state.lock().unwrap();

        let duplicate_in_flight = state
            .active
            .as_ref()
            .map(|job| job.job_id == job_id && !job.status.is_terminal())
            .unwrap_or(false)
            || state.queue.iter().any(|job| job.job_id == job_id);

        if duplicate_in_flight {
            tracing::debug!("Job {} already queued or in flight, ignoring", job_id);
            return false;
        }

        state.queue.push_back(Job {
            job_id: job_id.to_string(),
            spec,
            status: JobStatus::Queued,
            added_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        });
        drop(state);

        self.inner.notify.notify_one();
        true
    }

    pub fn board(&self) -> CompletionBoard {
        self.inner.board.clone()
    }

    /// Jobs still waiting plus the one being processed.
    pub fn pending(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.queue.len() + usize::from(state.active.is_some())
    }

    pub fn active(&self) -> Option<Job> {
        self.inner.state.lock().unwrap().active.clone()
    }

    /// Terminal jobs, most recent first.
    pub fn history(&self, limit: usize) -> Vec<Job> {
        let state = self.inner.state.lock().unwrap();
        state.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        let state = self.inner.state.lock().unwrap();
        state
            .active
            .iter()
            .chain(state.queue.iter())
            .chain(state.history.iter().rev())
            .find(|job| job.job_id == job_id)
            .cloned()
    }

    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn worker_loop(inner: Arc<QueueInner>) {
    loop {
        let job = loop {
            let next = inner.state.lock().unwrap().pop_next();
            match next {
                Some(job) => break job,
                None => inner.notify.notified().await,
            }
        };

        run_job(&inner, job).await;

        // Throttle between jobs; not correctness-critical.
        sleep(inner.config.inter_job_delay()).await;
    }
}

async fn run_job(inner: &Arc<QueueInner>, job: Job) {
    let key = job.spec.completion_key().to_string();
    let job_timeout = inner.timeout_for(job.spec.job_type());
    let receiver = inner.board.register(&key);

    tracing::info!("Processing job {} ({:?})", job.job_id, job.spec.job_type());

    let outcome: CompletionResult = match inner.executor.start(&job).await {
        Err(error) => {
            inner.board.cancel(&key);
            Err(format!("executor failed to start job: {}", error))
        }
        Ok(()) => match timeout(job_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err("completion signal dropped".to_string()),
            Err(_) => {
                inner.board.cancel(&key);
                Err(format!(
                    "timed out after {:?} waiting for completion of {}",
                    job_timeout, key
                ))
            }
        },
    };

    let mut state = inner.state.lock().unwrap();
    if let Some(mut finished) = state.active.take() {
        finished.completed_at = Some(Utc::now());
        match outcome {
            Ok(()) => {
                finished.status = JobStatus::Completed;
                tracing::info!("Job {} completed", finished.job_id);
            }
            Err(message) => {
                finished.status = JobStatus::Failed;
                tracing::warn!("Job {} failed: {}", finished.job_id, message);
                finished.error = Some(message);
            }
        }
        state.history.push(finished);
    }
}

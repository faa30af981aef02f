use anyhow::{Result, Context};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dispatch::job::{ExecutionResult, Job, JobId, StatusUpdate};
use crate::dispatch::retry::{Decision, RetryPolicy};
use crate::dispatch::store::TaskStore;
use crate::error::DispatchError;
use crate::fetch::{extract, FetchExecutor};
use crate::utils::metrics::{DispatchMetrics, ExecutionEnd};

const RESULT_BUFFER: usize = 256;

/// Everything a worker needs to run a job end to end
pub struct WorkerContext {
    pub store: Arc<dyn TaskStore>,
    pub executor: Arc<FetchExecutor>,
    pub policy: RetryPolicy,
    pub metrics: DispatchMetrics,
    /// Status write attempts before giving up
    pub write_attempts: u32,
    pub write_delay: Duration,
}

type Dispatched = (Job, OwnedSemaphorePermit);

/// Fixed set of workers executing dispatched jobs.
///
/// A job holds one of `size` slots from submission until its status is
/// written, so at most `size` jobs are in flight.
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    sender: Option<mpsc::Sender<Dispatched>>,
    results: broadcast::Sender<ExecutionResult>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(size: usize, context: Arc<WorkerContext>) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Dispatched>(size);
        let receiver = Arc::new(Mutex::new(receiver));
        let (results, _) = broadcast::channel(RESULT_BUFFER);

        info!("Starting {} workers", size);

        let workers = (0..size)
            .map(|i| {
                let receiver = receiver.clone();
                let context = context.clone();
                let results = results.clone();

                tokio::spawn(async move {
                    debug!("Worker {} started", i);

                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some((job, permit)) = next else {
                            break;
                        };

                        let span = info_span!("job", id = job.id, execution = %Uuid::new_v4(), worker = i);
                        let result = execute(&context, job).instrument(span).await;
                        drop(permit);

                        // No subscribers is fine
                        let _ = results.send(result);
                    }

                    debug!("Worker {} stopped", i);
                })
            })
            .collect();

        Self {
            slots: Arc::new(Semaphore::new(size)),
            sender: Some(sender),
            results,
            workers,
        }
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Hand a RUNNING job to the workers, waiting for a free slot
    pub async fn submit(&self, job: Job) -> Result<()> {
        let sender = self.sender.as_ref().context("Worker pool is shut down")?;
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .context("Worker pool is shut down")?;

        sender
            .send((job, permit))
            .await
            .map_err(|_| anyhow::anyhow!("Worker pool is shut down"))
    }

    /// Execution results as workers publish them
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionResult> {
        self.results.subscribe()
    }

    /// Stop accepting jobs and wait for in-flight ones to finish
    pub async fn shutdown(mut self) {
        self.sender.take();
        self.slots.close();

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

/// Fetch one RUNNING job, decide its next state and persist it
pub async fn execute(context: &WorkerContext, job: Job) -> ExecutionResult {
    debug!("Fetching {}", job.url);

    let outcome = context.executor.fetch_job(&job).await;
    context
        .metrics
        .record_fetch(outcome.latency, outcome.status, outcome.is_degraded())
        .await;
    for degradation in &outcome.degradations {
        debug!("Degraded fetch: {}", degradation);
    }

    let data = outcome
        .body
        .as_deref()
        .filter(|_| outcome.success)
        .map(|body| extract(body, &job.config.selectors));

    let decision = context.policy.decide(&job, &outcome, Utc::now());
    let end = match &decision {
        Decision::Complete { .. } => {
            info!("Job {} completed", job.id);
            ExecutionEnd::Completed
        }
        Decision::Reschedule { retry_count, delay, error, .. } => {
            info!(
                "Job {} failed ({}), retry {} in {}s",
                job.id,
                error,
                retry_count,
                delay.as_secs()
            );
            ExecutionEnd::Rescheduled
        }
        Decision::Fail { error } => {
            warn!("Job {} failed: {}", job.id, error);
            ExecutionEnd::Failed
        }
    };

    let update = decision.into_update(data.as_ref().map(|data| json!({ "data": data })));
    let end = match persist(context, job.id, &update).await {
        Ok(true) => end,
        Ok(false) => {
            info!("Job {} is no longer running, discarding result", job.id);
            ExecutionEnd::Discarded
        }
        Err(e) => {
            error!("{:#}", e);
            ExecutionEnd::Unpersisted
        }
    };
    context.metrics.record_end(end).await;

    if end == ExecutionEnd::Discarded {
        return ExecutionResult {
            success: false,
            task_id: job.id,
            data: None,
            error: Some(format!("Job {} is no longer running, result discarded", job.id)),
        };
    }

    ExecutionResult {
        success: outcome.success,
        task_id: job.id,
        data,
        error: (!outcome.success).then(|| outcome.error_message()),
    }
}

/// Write `update`, retrying a bounded number of times.
///
/// Ok(false) means the job moved on while in flight (cancelled or removed).
async fn persist(context: &WorkerContext, job_id: JobId, update: &StatusUpdate) -> Result<bool> {
    let attempts = context.write_attempts.max(1);
    let mut attempt = 1;

    loop {
        match context.store.update_status(job_id, update).await {
            Ok(applied) => return Ok(applied),
            Err(e) if matches!(e.downcast_ref::<DispatchError>(), Some(DispatchError::NotFound(_))) => {
                return Ok(false);
            }
            Err(e) if attempt < attempts => {
                warn!("Status write for job {} failed (attempt {}/{}): {:#}", job_id, attempt, attempts, e);
                tokio::time::sleep(context.write_delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(DispatchError::Store(format!("{:#}", e))).context(format!(
                    "Failed to persist {} status of job {} after {} attempts",
                    update.status, job_id, attempts
                ));
            }
        }
    }
}

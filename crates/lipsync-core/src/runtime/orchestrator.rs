use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::runtime::config::Config;
use crate::runtime::gate::ExecutionGate;
use crate::runtime::pipeline::Pipeline;
use crate::runtime::types::{
    FailureKind, JobId, JobRecord, RuntimeError, TaskId, TaskOutcome, TaskRecord, TaskStatus,
    TaskUpdate, ValidationError,
};
use crate::storage::{Store, StoreError};

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<TaskId>>>;

/// What [`Dispatcher::recover`] did with the unfinished tasks it found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Tasks still `queued`; they were put back on the work queue.
    pub requeued: Vec<TaskId>,
    /// Tasks caught mid-pipeline; they were failed and must be resubmitted.
    pub interrupted: Vec<TaskId>,
}

struct Inner<S> {
    store: Arc<S>,
    pipeline: Pipeline,
    gate: ExecutionGate,
    config: Config,
    queue_tx: mpsc::Sender<TaskId>,
    in_flight: Mutex<HashSet<TaskId>>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// The runtime dispatcher.
///
/// Accepts task submissions, hands them to a fixed pool of workers over a
/// bounded queue, and runs each task through the [`Pipeline`] while holding
/// an [`ExecutionGate`] slot.
///
/// # Usage
///
/// ```rust,ignore
/// let dispatcher = Dispatcher::start(store, pipeline, Config::default())?;
/// dispatcher.recover().await?;
/// let task_id = dispatcher.submit(job_id, "hello there").await?;
/// let record = dispatcher.task(task_id).await?;
/// ```
pub struct Dispatcher<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> std::fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("gate", &self.inner.gate)
            .field("workers", &self.inner.config.worker_count())
            .field("queue_capacity", &self.inner.config.queue_capacity)
            .finish_non_exhaustive()
    }
}

impl<S: Store> Dispatcher<S> {
    /// Start the dispatcher.
    ///
    /// Validates `config`, creates the work queue and the execution gate, and
    /// spawns `config.worker_count()` workers. Must be called from within a
    /// Tokio runtime.
    pub fn start(store: Arc<S>, pipeline: Pipeline, config: Config) -> Result<Self, RuntimeError> {
        config.validate()?;

        let (queue_tx, queue_rx) = mpsc::channel::<TaskId>(config.queue_capacity);
        let queue_rx: SharedReceiver = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let (shutdown_tx, _) = watch::channel(false);
        let worker_count = config.worker_count();

        let dispatcher = Self {
            inner: Arc::new(Inner {
                store,
                pipeline,
                gate: ExecutionGate::new(config.concurrency),
                config,
                queue_tx,
                in_flight: Mutex::new(HashSet::new()),
                shutdown_tx,
                workers: Mutex::new(Vec::with_capacity(worker_count)),
            }),
        };

        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|worker_id| {
                let worker = dispatcher.clone();
                let rx = Arc::clone(&queue_rx);
                let shutdown = dispatcher.inner.shutdown_tx.subscribe();
                tokio::spawn(async move { worker.worker_loop(worker_id, rx, shutdown).await })
            })
            .collect();
        *dispatcher
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handles;

        info!(
            workers = worker_count,
            concurrency = dispatcher.inner.config.concurrency,
            queue_capacity = dispatcher.inner.config.queue_capacity,
            "dispatcher started"
        );
        Ok(dispatcher)
    }

    // ── Workers ──────────────────────────────────────────────────────────────

    async fn worker_loop(
        self,
        worker_id: usize,
        rx: SharedReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(worker_id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => None,
                task_id = async { rx.lock().await.recv().await } => task_id,
            };
            let Some(task_id) = next else {
                break;
            };

            match self.run(task_id).await {
                Ok(TaskOutcome::Done { .. }) => {
                    debug!(worker_id, %task_id, "worker finished task");
                }
                Ok(TaskOutcome::Failed { kind, .. }) => {
                    debug!(worker_id, %task_id, %kind, "worker finished failed task");
                }
                Err(RuntimeError::Shutdown) => break,
                Err(
                    e @ (RuntimeError::AlreadyRunning { .. }
                    | RuntimeError::AlreadyTerminal { .. }
                    | RuntimeError::NotRunnable { .. }
                    | RuntimeError::TaskNotFound { .. }),
                ) => {
                    warn!(worker_id, %task_id, error = %e, "skipping work unit");
                }
                Err(e) => {
                    error!(worker_id, %task_id, error = %e, "work unit failed");
                }
            }
        }
        debug!(worker_id, "worker stopped");
    }

    // ── Public API ───────────────────────────────────────────────────────────

    /// Validate `text`, record a `queued` task for `job_id` and enqueue it.
    ///
    /// Returns the new [`TaskId`] immediately; execution happens on a worker.
    /// A queue slot is reserved before the record is written, so a full queue
    /// ([`RuntimeError::QueueFull`]) leaves no record behind and a written
    /// record is always delivered.
    pub async fn submit(&self, job_id: JobId, text: &str) -> Result<TaskId, RuntimeError> {
        let text = self.validate_text(text)?;

        if *self.inner.shutdown_tx.borrow() {
            return Err(RuntimeError::Shutdown);
        }
        if self.inner.store.get_job(job_id).await?.is_none() {
            return Err(RuntimeError::JobNotFound { job_id });
        }

        let slot = self.inner.queue_tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => RuntimeError::QueueFull {
                capacity: self.inner.config.queue_capacity,
            },
            mpsc::error::TrySendError::Closed(()) => RuntimeError::Shutdown,
        })?;

        let task = TaskRecord::queued(job_id, text);
        let task_id = task.task_id;
        self.inner
            .store
            .create_task(task)
            .await
            .inspect_err(|e| error!(%job_id, error = %e, "failed to record task"))?;
        slot.send(task_id);

        info!(%task_id, %job_id, "task queued");
        Ok(task_id)
    }

    /// Run one task to completion on the calling task.
    ///
    /// At most one run per task is ever in flight: a concurrent second call
    /// gets [`RuntimeError::AlreadyRunning`], a call after completion gets
    /// [`RuntimeError::AlreadyTerminal`], and a record left mid-pipeline with
    /// no owner gets [`RuntimeError::NotRunnable`].
    pub async fn run(&self, task_id: TaskId) -> Result<TaskOutcome, RuntimeError> {
        let _claim = InFlight::claim(&self.inner.in_flight, task_id)?;

        let task = self
            .inner
            .store
            .get_task(task_id)
            .await?
            .ok_or(RuntimeError::TaskNotFound { task_id })?;
        match task.status {
            status if status.is_terminal() => {
                return Err(RuntimeError::AlreadyTerminal { task_id, status });
            }
            TaskStatus::Queued => {}
            status => return Err(RuntimeError::NotRunnable { task_id, status }),
        }

        let Some(job) = self.inner.store.get_job(task.job_id).await? else {
            let record = self
                .inner
                .store
                .update_task(
                    task_id,
                    TaskUpdate::fail(format!("job {} no longer exists", task.job_id)),
                )
                .await?;
            warn!(%task_id, job_id = %task.job_id, "task references a missing job");
            return Ok(TaskOutcome::Failed {
                kind: FailureKind::Collaborator,
                message: record.error_message.unwrap_or_default(),
            });
        };

        let waiting = Instant::now();
        let _permit = self.inner.gate.acquire().await?;
        debug!(
            %task_id,
            waited_ms = waiting.elapsed().as_millis() as u64,
            in_use = self.inner.gate.in_use(),
            "execution gate acquired"
        );

        let outcome = self
            .inner
            .pipeline
            .execute(&task, &job, self.inner.store.as_ref())
            .await?;
        Ok(outcome)
    }

    /// Current record of a task.
    pub async fn task(&self, task_id: TaskId) -> Result<TaskRecord, RuntimeError> {
        self.inner
            .store
            .get_task(task_id)
            .await?
            .ok_or(RuntimeError::TaskNotFound { task_id })
    }

    /// Current record of a job.
    pub async fn job(&self, job_id: JobId) -> Result<JobRecord, RuntimeError> {
        self.inner
            .store
            .get_job(job_id)
            .await?
            .ok_or(RuntimeError::JobNotFound { job_id })
    }

    /// Reconcile unfinished tasks left by a previous process.
    ///
    /// `queued` tasks never started a stage, so they are enqueued again.
    /// Tasks caught mid-pipeline are failed: stages are not idempotent, so
    /// the client has to resubmit. Tasks running in this process are left
    /// alone.
    pub async fn recover(&self) -> Result<RecoveryReport, RuntimeError> {
        let mut report = RecoveryReport::default();

        for task in self.inner.store.list_unfinished().await? {
            let task_id = task.task_id;
            if self.is_in_flight(task_id) {
                continue;
            }
            match task.status {
                TaskStatus::Queued => {
                    self.inner
                        .queue_tx
                        .send(task_id)
                        .await
                        .map_err(|_| RuntimeError::Shutdown)?;
                    report.requeued.push(task_id);
                }
                status => {
                    let message = format!(
                        "interrupted during {status}: the service stopped before the task \
                         finished; resubmit to try again"
                    );
                    match self
                        .inner
                        .store
                        .update_task(task_id, TaskUpdate::fail(message))
                        .await
                    {
                        Ok(_) => report.interrupted.push(task_id),
                        Err(StoreError::Terminal { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        if !report.requeued.is_empty() || !report.interrupted.is_empty() {
            info!(
                requeued = report.requeued.len(),
                interrupted = report.interrupted.len(),
                "recovered unfinished tasks"
            );
        }
        Ok(report)
    }

    /// Stop accepting and dequeuing work, then wait for running tasks.
    ///
    /// Tasks still on the queue stay `queued` in the store and are picked up
    /// by [`Dispatcher::recover`] on the next start. Calling this twice is a
    /// no-op.
    pub async fn shutdown(&self) {
        if self.inner.shutdown_tx.send_replace(true) {
            return;
        }
        self.inner.gate.close();

        let handles = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker terminated abnormally");
            }
        }
        info!("dispatcher stopped");
    }

    pub fn gate(&self) -> &ExecutionGate {
        &self.inner.gate
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Work units waiting on the queue.
    pub fn queue_len(&self) -> usize {
        self.inner.queue_tx.max_capacity() - self.inner.queue_tx.capacity()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    // ── private helpers ──────────────────────────────────────────────────────

    fn validate_text(&self, text: &str) -> Result<String, ValidationError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyText);
        }
        let len = text.chars().count();
        let max = self.inner.config.max_text_chars;
        if len > max {
            return Err(ValidationError::TextTooLong { len, max });
        }
        Ok(text.to_owned())
    }

    fn is_in_flight(&self, task_id: TaskId) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&task_id)
    }
}

/// Ownership claim on one task id; released on drop.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<TaskId>>,
    task_id: TaskId,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a Mutex<HashSet<TaskId>>, task_id: TaskId) -> Result<Self, RuntimeError> {
        let mut guard = set.lock().unwrap_or_else(PoisonError::into_inner);
        if !guard.insert(task_id) {
            return Err(RuntimeError::AlreadyRunning { task_id });
        }
        Ok(Self { set, task_id })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task_id);
    }
}

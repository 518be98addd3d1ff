//! Pooled worker bound to one task queue.
//!
//! A worker polls the backend for tasks on its queue, claims them (to prevent
//! duplicate execution), and executes them. Two kinds of task exist:
//!
//! - **Workflow turns** replay the workflow code against the run's history
//!   and record what it decided: a new activity call, completion or failure.
//! - **Activity attempts** run one activity under its start-to-close timeout
//!   and record the result, or re-enqueue the attempt with backoff when the
//!   retry policy allows it.
//!
//! A run has at most one queued task at a time, so the worker holding that
//! task is the only writer of the run's snapshot.

use anyhow::Result;
use bytes::Bytes;
use crystalflow_core::codec::Codec;
use crystalflow_core::context::WorkflowContext;
use crystalflow_core::error::{ActivityError, ActivityFailure, WorkflowFailure};
use crystalflow_core::registry::{ActivityRegistry, WorkflowRegistry};
use crystalflow_core::snapshot::{HistoryEvent, WorkflowSnapshot};
use crystalflow_core::task::ActivityOptions;
use crystalflow_core::task_claim::{AvailableTask, TaskKind};
use crystalflow_core::task_queue::{Capabilities, TaskQueue, TaskQueueRegistry};
use crystalflow_core::workflow::{TurnOutcome, run_turn};
use crystalflow_persistence::PersistentBackend;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time;

/// A worker that claims and executes tasks from one queue of a shared
/// backend.
///
/// Several workers may poll the same queue, in one process or many. Task
/// claims carry a TTL so the tasks of a crashed worker become available
/// again; a heartbeat keeps the claim of a long activity alive.
///
/// # Example
///
/// ```rust,ignore
/// let worker = PooledWorker::new("gpu-worker-1", TaskQueue::Gpu, backend, codec, routing)
///     .with_workflows(workflows)
///     .with_activities(activities)
///     .with_max_concurrency(NonZeroUsize::new(8).unwrap());
///
/// worker.start_polling(shutdown_rx).await?;
/// ```
pub struct PooledWorker<B, C> {
    worker_id: String,
    task_queue: TaskQueue,
    backend: Arc<B>,
    codec: Arc<C>,
    routing: Arc<TaskQueueRegistry>,
    workflows: WorkflowRegistry<C>,
    activities: ActivityRegistry,
    claim_ttl: Option<Duration>,
    heartbeat_interval: Option<Duration>,
    poll_interval: Duration,
    batch_size: NonZeroUsize,
    max_concurrency: NonZeroUsize,
}

impl<B, C> PooledWorker<B, C>
where
    B: PersistentBackend + 'static,
    C: Codec,
{
    /// Create a worker polling `task_queue`.
    ///
    /// Defaults: 5 minute claim TTL, heartbeat every 2 minutes, poll every
    /// 200 ms, one task per poll and sequential execution.
    pub fn new(
        worker_id: impl Into<String>,
        task_queue: TaskQueue,
        backend: B,
        codec: Arc<C>,
        routing: Arc<TaskQueueRegistry>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            task_queue,
            backend: Arc::new(backend),
            codec,
            routing,
            workflows: WorkflowRegistry::new(),
            activities: ActivityRegistry::new(),
            claim_ttl: Some(Duration::from_secs(5 * 60)),
            heartbeat_interval: Some(Duration::from_secs(2 * 60)),
            poll_interval: Duration::from_millis(200),
            batch_size: NonZeroUsize::MIN,
            max_concurrency: NonZeroUsize::MIN,
        }
    }

    /// Workflow types this worker runs turns for.
    #[must_use]
    pub fn with_workflows(mut self, workflows: WorkflowRegistry<C>) -> Self {
        self.workflows = workflows;
        self
    }

    /// Activities this worker executes.
    #[must_use]
    pub fn with_activities(mut self, activities: ActivityRegistry) -> Self {
        self.activities = activities;
        self
    }

    /// Set the TTL for task claims.
    #[must_use]
    pub fn with_claim_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.claim_ttl = ttl;
        self
    }

    /// Set the heartbeat interval for claim refreshing.
    ///
    /// Should be less than the claim TTL. `None` disables heartbeats.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// How long to sleep when the queue has nothing for this worker. Also
    /// the period at which cancellation requests are checked.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the number of tasks to fetch per poll.
    #[must_use]
    pub fn with_batch_size(mut self, size: NonZeroUsize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the maximum number of concurrent task executions.
    ///
    /// Each concurrent task maintains its own heartbeat.
    #[must_use]
    pub fn with_max_concurrency(mut self, max: NonZeroUsize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn task_queue(&self) -> TaskQueue {
        self.task_queue
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.get()
    }

    /// Everything this worker registered.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            workflows: self.workflows.names().map(str::to_string).collect(),
            activities: self.activities.names().map(str::to_string).collect(),
        }
    }

    /// Check the worker's registrations against the routing table.
    pub fn verify(&self) -> Result<()> {
        self.routing
            .verify_worker(self.task_queue, &self.capabilities())?;
        Ok(())
    }

    /// Claim and execute one task.
    ///
    /// Returns without doing anything if another worker holds the claim.
    pub async fn execute_task(&self, task: AvailableTask) -> Result<()> {
        let claim = self
            .backend
            .claim_task(
                &task.instance_id,
                &task.task_id,
                &self.worker_id,
                self.claim_ttl
                    .and_then(|d| chrono::Duration::from_std(d).ok()),
            )
            .await?;

        if claim.is_none() {
            tracing::debug!(
                instance_id = %task.instance_id,
                task_id = %task.task_id,
                "Task was already claimed by another worker"
            );
            return Ok(());
        }

        let heartbeat = self.spawn_heartbeat(&task);
        let result = self.process_claimed(&task).await;
        if let Some(handle) = heartbeat {
            handle.abort();
        }

        match result {
            Ok(()) => {
                self.backend
                    .complete_task(&task.instance_id, &task.task_id)
                    .await?;
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    instance_id = %task.instance_id,
                    task_id = %task.task_id,
                    error = %e,
                    "Task execution failed, releasing claim"
                );
                let _ = self
                    .backend
                    .release_task_claim(&task.instance_id, &task.task_id, &self.worker_id)
                    .await;
                Err(e)
            }
        }
    }

    async fn process_claimed(&self, task: &AvailableTask) -> Result<()> {
        let mut snapshot = self.backend.load_snapshot(&task.instance_id).await?;

        if snapshot.is_terminal() {
            tracing::debug!(
                instance_id = %task.instance_id,
                task_id = %task.task_id,
                "Run already finished, dropping task"
            );
            return Ok(());
        }

        if let Some(reason) = self.backend.cancellation_reason(&task.instance_id).await? {
            tracing::info!(
                instance_id = %task.instance_id,
                reason = %reason,
                "Workflow cancelled"
            );
            snapshot.mark_cancelled(reason);
            self.backend.save_snapshot(snapshot).await?;
            return Ok(());
        }

        match &task.kind {
            TaskKind::Workflow { .. } => self.run_workflow_turn(snapshot).await,
            TaskKind::Activity {
                seq,
                activity,
                attempt,
            } => {
                self.run_activity_attempt(snapshot, task, *seq, activity, *attempt)
                    .await
            }
        }
    }

    async fn run_workflow_turn(&self, mut snapshot: WorkflowSnapshot) -> Result<()> {
        let workflow = self.workflows.get(&snapshot.workflow_type).ok_or_else(|| {
            anyhow::anyhow!(
                "Workflow type '{}' is not registered on worker {}",
                snapshot.workflow_type,
                self.worker_id
            )
        })?;

        let ctx = WorkflowContext::new(
            &snapshot.instance_id,
            Arc::clone(&self.codec),
            snapshot.history.clone(),
        );
        let input = snapshot.initial_input_bytes();

        match run_turn(workflow.as_ref(), ctx, input) {
            TurnOutcome::Completed(output) => {
                tracing::info!(
                    instance_id = %snapshot.instance_id,
                    workflow_type = %snapshot.workflow_type,
                    activities = snapshot.completed_activities(),
                    "Workflow complete"
                );
                snapshot.mark_completed(output);
                self.backend.save_snapshot(snapshot).await?;
            }
            TurnOutcome::Failed(failure) => {
                tracing::warn!(
                    instance_id = %snapshot.instance_id,
                    workflow_type = %snapshot.workflow_type,
                    error = %failure,
                    "Workflow failed"
                );
                snapshot.mark_failed(failure);
                self.backend.save_snapshot(snapshot).await?;
            }
            TurnOutcome::Scheduled(scheduled) => {
                let queue = match scheduled.options.task_queue {
                    Some(queue) => Ok(queue),
                    None => self.routing.queue_for_activity(&scheduled.activity),
                };
                let queue = match queue {
                    Ok(queue) => queue,
                    Err(e) => {
                        tracing::error!(
                            instance_id = %snapshot.instance_id,
                            activity = %scheduled.activity,
                            error = %e,
                            "Activity cannot be routed"
                        );
                        snapshot.mark_failed(WorkflowFailure::new(ActivityError::NotFound(
                            e.to_string(),
                        )));
                        self.backend.save_snapshot(snapshot).await?;
                        return Ok(());
                    }
                };

                tracing::debug!(
                    instance_id = %snapshot.instance_id,
                    seq = scheduled.seq,
                    activity = %scheduled.activity,
                    task_queue = %queue,
                    "Scheduling activity"
                );
                let next = AvailableTask::activity(
                    snapshot.instance_id.clone(),
                    queue,
                    scheduled.seq,
                    scheduled.activity.clone(),
                    1,
                    scheduled.input.clone(),
                );
                snapshot.record_activity_scheduled(
                    scheduled.seq,
                    scheduled.activity,
                    queue,
                    scheduled.options,
                    scheduled.input,
                );
                self.backend.save_snapshot(snapshot).await?;
                self.backend.enqueue_task(next).await?;
            }
            TurnOutcome::Waiting => {
                tracing::debug!(
                    instance_id = %snapshot.instance_id,
                    pending = ?snapshot.pending_activity(),
                    "Workflow waiting on activity"
                );
            }
        }
        Ok(())
    }

    async fn run_activity_attempt(
        &self,
        mut snapshot: WorkflowSnapshot,
        task: &AvailableTask,
        seq: u32,
        activity: &str,
        attempt: u32,
    ) -> Result<()> {
        if snapshot.is_activity_resolved(seq) {
            tracing::debug!(
                instance_id = %task.instance_id,
                seq,
                "Activity already resolved, dropping duplicate attempt"
            );
            return Ok(());
        }

        let implementation = self.activities.get(activity).ok_or_else(|| {
            anyhow::anyhow!(
                "Activity '{}' is not registered on worker {}",
                activity,
                self.worker_id
            )
        })?;
        let options = match snapshot.scheduled_activity(seq) {
            Some(HistoryEvent::ActivityScheduled { options, .. }) => options.clone(),
            _ => ActivityOptions::default(),
        };
        let timeout = options.start_to_close_timeout;

        tracing::info!(
            instance_id = %task.instance_id,
            activity = %activity,
            attempt,
            "Executing activity"
        );

        let result = tokio::select! {
            outcome = time::timeout(timeout, implementation.run(task.input.clone())) => {
                outcome.unwrap_or_else(|_| {
                    Err(ActivityError::Timeout(format!(
                        "'{}' did not finish within {:?}",
                        activity, timeout
                    )))
                })
            }
            reason = self.wait_for_cancellation(&task.instance_id) => {
                Err(ActivityError::Cancelled(reason))
            }
        };

        match result {
            Ok(output) => {
                tracing::info!(
                    instance_id = %task.instance_id,
                    activity = %activity,
                    attempt,
                    "Activity completed"
                );
                snapshot.record_activity_completed(seq, attempt, output);
                self.save_and_resume(snapshot).await
            }
            Err(ActivityError::Cancelled(reason)) => {
                tracing::info!(
                    instance_id = %task.instance_id,
                    activity = %activity,
                    reason = %reason,
                    "Activity cancelled"
                );
                snapshot.mark_cancelled(reason);
                self.backend.save_snapshot(snapshot).await?;
                Ok(())
            }
            Err(error) if options.retry_policy.should_retry(&error, attempt) => {
                let delay = options.retry_policy.backoff(attempt);
                tracing::warn!(
                    instance_id = %task.instance_id,
                    activity = %activity,
                    attempt,
                    error = %error,
                    retry_in = ?delay,
                    "Activity attempt failed, retrying"
                );
                let not_before = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| chrono::Utc::now().checked_add_signed(d))
                    .unwrap_or_else(chrono::Utc::now);
                let retry = AvailableTask::activity(
                    task.instance_id.clone(),
                    task.task_queue,
                    seq,
                    activity,
                    attempt + 1,
                    task.input.clone(),
                )
                .not_before(not_before);
                self.backend.enqueue_task(retry).await?;
                Ok(())
            }
            Err(error) => {
                tracing::warn!(
                    instance_id = %task.instance_id,
                    activity = %activity,
                    attempt,
                    error = %error,
                    "Activity failed"
                );
                snapshot.record_activity_failed(
                    seq,
                    ActivityFailure {
                        activity: activity.to_string(),
                        attempts: attempt,
                        error,
                    },
                );
                self.save_and_resume(snapshot).await
            }
        }
    }

    /// Persist a history change and queue the workflow turn that reacts to it.
    async fn save_and_resume(&self, snapshot: WorkflowSnapshot) -> Result<()> {
        let turn = AvailableTask::workflow(
            snapshot.instance_id.clone(),
            snapshot.next_workflow_task_id(),
            snapshot.task_queue,
            snapshot.workflow_type.clone(),
            Bytes::new(),
        );
        self.backend.save_snapshot(snapshot).await?;
        self.backend.enqueue_task(turn).await?;
        Ok(())
    }

    /// Resolves with the reason once cancellation of the run is requested.
    async fn wait_for_cancellation(&self, instance_id: &str) -> String {
        let mut interval = time::interval(self.poll_interval);
        loop {
            interval.tick().await;
            match self.backend.cancellation_reason(instance_id).await {
                Ok(Some(reason)) => return reason,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        instance_id = %instance_id,
                        error = %e,
                        "Failed to check for cancellation"
                    );
                }
            }
        }
    }

    fn spawn_heartbeat(&self, task: &AvailableTask) -> Option<JoinHandle<()>> {
        let interval = self.heartbeat_interval?;
        let ttl = self
            .claim_ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())?;
        let backend = Arc::clone(&self.backend);
        let instance_id = task.instance_id.clone();
        let task_id = task.task_id.clone();
        let worker_id = self.worker_id.clone();

        Some(tokio::spawn(async move {
            let mut interval_timer = time::interval(interval);
            interval_timer.tick().await; // Skip first immediate tick

            loop {
                interval_timer.tick().await;
                match backend
                    .extend_task_claim(&instance_id, &task_id, &worker_id, ttl)
                    .await
                {
                    Ok(()) => tracing::trace!(
                        instance_id = %instance_id,
                        task_id = %task_id,
                        "Extended task claim via heartbeat"
                    ),
                    Err(e) => tracing::warn!(
                        instance_id = %instance_id,
                        task_id = %task_id,
                        error = %e,
                        "Failed to extend task claim during heartbeat"
                    ),
                }
            }
        }))
    }

    fn spawn_execution(worker: &Arc<Self>, task: AvailableTask, permit: OwnedSemaphorePermit) {
        let worker = Arc::clone(worker);
        tokio::spawn(async move {
            let _permit = permit; // Hold permit until task completes
            if let Err(e) = worker.execute_task(task).await {
                tracing::error!(
                    worker_id = %worker.worker_id,
                    error = %e,
                    "Task execution failed"
                );
            }
        });
    }

    /// Poll the queue and execute tasks until `shutdown` turns true.
    ///
    /// Task execution is gated by a semaphore sized by `max_concurrency`. On
    /// shutdown the worker stops polling and waits for in-flight tasks.
    ///
    /// # Errors
    ///
    /// Fails before polling if the worker's registrations disagree with the
    /// routing table, or when the backend cannot be queried.
    pub async fn start_polling(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.verify()?;

        let capabilities = self.capabilities();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency.get()));
        let worker = Arc::new(self);
        let mut interval = time::interval(worker.poll_interval);

        tracing::info!(
            worker_id = %worker.worker_id,
            task_queue = %worker.task_queue,
            max_concurrency = worker.max_concurrency.get(),
            workflows = ?capabilities.workflows,
            activities = ?capabilities.activities,
            "Worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => permit?,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let available_tasks = worker
                .backend
                .find_available_tasks(worker.task_queue, &capabilities, worker.batch_size.get())
                .await?;

            let mut tasks = available_tasks.into_iter();
            match tasks.next() {
                Some(task) => {
                    Self::spawn_execution(&worker, task, permit);
                    // Rest of the batch runs only while permits are free.
                    for task in tasks {
                        match Arc::clone(&semaphore).try_acquire_owned() {
                            Ok(permit) => Self::spawn_execution(&worker, task, permit),
                            Err(_) => break,
                        }
                    }
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = interval.tick() => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        tracing::info!(
            worker_id = %worker.worker_id,
            "Worker stopping, waiting for in-flight tasks"
        );
        let permits = u32::try_from(worker.max_concurrency.get()).unwrap_or(u32::MAX);
        let _drained = semaphore.acquire_many(permits).await?;
        tracing::info!(worker_id = %worker.worker_id, "Worker stopped");
        Ok(())
    }
}

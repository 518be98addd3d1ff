//! Client side of the engine: start runs, inspect them, wait for results
//! and request cancellation.

use chrono::{DateTime, Utc};
use crystalflow_core::codec::{Codec, sealed};
use crystalflow_core::error::{WorkflowError, WorkflowFailure};
use crystalflow_core::snapshot::{WorkflowSnapshot, WorkflowSnapshotState};
use crystalflow_core::task_claim::AvailableTask;
use crystalflow_core::task_queue::{TaskQueue, TaskQueueRegistry};
use crystalflow_persistence::{BackendError, PersistentBackend};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] WorkflowError),
    #[error("workflow run '{0}' not found")]
    NotFound(String),
    #[error("workflow run '{0}' already exists")]
    AlreadyExists(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("timed out waiting for workflow run '{0}'")]
    Timeout(String),
    #[error(transparent)]
    Backend(BackendError),
}

impl From<BackendError> for ClientError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(id) => ClientError::NotFound(id),
            BackendError::AlreadyExists(id) => ClientError::AlreadyExists(id),
            other => ClientError::Backend(other),
        }
    }
}

/// Handle to a started run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowHandle {
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: TaskQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    fn of(state: &WorkflowSnapshotState) -> Self {
        match state {
            WorkflowSnapshotState::Running => WorkflowStatus::Running,
            WorkflowSnapshotState::Completed { .. } => WorkflowStatus::Completed,
            WorkflowSnapshotState::Failed { .. } => WorkflowStatus::Failed,
            WorkflowSnapshotState::Cancelled { .. } => WorkflowStatus::Cancelled,
        }
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowDescription {
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: TaskQueue,
    pub status: WorkflowStatus,
    /// Activity the run is currently waiting on.
    pub pending_activity: Option<String>,
    pub completed_activities: usize,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Final state of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome<O> {
    Completed(O),
    Failed(WorkflowFailure),
    Cancelled(String),
}

/// Starts and observes workflow runs through a shared backend.
pub struct WorkflowClient<B, C> {
    backend: Arc<B>,
    codec: Arc<C>,
    routing: Arc<TaskQueueRegistry>,
    poll_interval: Duration,
}

impl<B, C> Clone for WorkflowClient<B, C> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            codec: Arc::clone(&self.codec),
            routing: Arc::clone(&self.routing),
            poll_interval: self.poll_interval,
        }
    }
}

impl<B, C> WorkflowClient<B, C>
where
    B: PersistentBackend,
    C: Codec,
{
    pub fn new(backend: B, codec: Arc<C>, routing: Arc<TaskQueueRegistry>) -> Self {
        Self {
            backend: Arc::new(backend),
            codec,
            routing,
            poll_interval: Duration::from_millis(200),
        }
    }

    /// How often [`get_result`](Self::get_result) re-reads the run.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Start a run of `workflow_type` on the queue the routing table assigns.
    ///
    /// # Errors
    ///
    /// `ClientError::Config` if the type is unrouted and
    /// `ClientError::AlreadyExists` if `workflow_id` is taken.
    pub async fn start_workflow<I>(
        &self,
        workflow_type: &str,
        workflow_id: &str,
        input: &I,
    ) -> Result<WorkflowHandle, ClientError>
    where
        C: sealed::EncodeValue<I>,
    {
        let task_queue = self.routing.queue_for_workflow(workflow_type)?;
        let input = self
            .codec
            .encode(input)
            .map_err(|e| ClientError::Codec(e.to_string()))?;

        let snapshot = WorkflowSnapshot::new(workflow_id, workflow_type, task_queue, input.clone());
        let first_turn = AvailableTask::workflow(
            workflow_id,
            snapshot.next_workflow_task_id(),
            task_queue,
            workflow_type,
            input,
        );
        self.backend.create_snapshot(snapshot).await?;
        self.backend.enqueue_task(first_turn).await?;

        tracing::info!(
            workflow_id = %workflow_id,
            workflow_type = %workflow_type,
            task_queue = %task_queue,
            "Workflow started"
        );

        Ok(WorkflowHandle {
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow_type.to_string(),
            task_queue,
        })
    }

    pub async fn describe(&self, workflow_id: &str) -> Result<WorkflowDescription, ClientError> {
        let snapshot = self.backend.load_snapshot(workflow_id).await?;
        let cancel_requested = self
            .backend
            .cancellation_reason(workflow_id)
            .await?
            .is_some();

        Ok(WorkflowDescription {
            status: WorkflowStatus::of(&snapshot.state),
            pending_activity: snapshot.pending_activity().map(str::to_string),
            completed_activities: snapshot.completed_activities(),
            cancel_requested,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            workflow_id: snapshot.instance_id,
            workflow_type: snapshot.workflow_type,
            task_queue: snapshot.task_queue,
        })
    }

    /// Wait up to `wait` for the run to finish and return its outcome.
    ///
    /// # Errors
    ///
    /// `ClientError::NotFound` for an unknown id and `ClientError::Timeout`
    /// if the run is still going when `wait` elapses.
    pub async fn get_result<O>(
        &self,
        workflow_id: &str,
        wait: Duration,
    ) -> Result<WorkflowOutcome<O>, ClientError>
    where
        C: sealed::DecodeValue<O>,
    {
        time::timeout(wait, self.poll_outcome(workflow_id))
            .await
            .map_err(|_| ClientError::Timeout(workflow_id.to_string()))?
    }

    async fn poll_outcome<O>(&self, workflow_id: &str) -> Result<WorkflowOutcome<O>, ClientError>
    where
        C: sealed::DecodeValue<O>,
    {
        loop {
            let snapshot = self.backend.load_snapshot(workflow_id).await?;
            match snapshot.state {
                WorkflowSnapshotState::Running => time::sleep(self.poll_interval).await,
                WorkflowSnapshotState::Completed { final_output } => {
                    let output = self
                        .codec
                        .decode(&final_output)
                        .map_err(|e| ClientError::Codec(e.to_string()))?;
                    return Ok(WorkflowOutcome::Completed(output));
                }
                WorkflowSnapshotState::Failed { failure } => {
                    return Ok(WorkflowOutcome::Failed(failure));
                }
                WorkflowSnapshotState::Cancelled { reason } => {
                    return Ok(WorkflowOutcome::Cancelled(reason));
                }
            }
        }
    }

    /// Request cancellation of a run.
    ///
    /// Finished runs are left untouched. A pending activity is abandoned the
    /// next time a worker observes the request.
    pub async fn cancel(&self, workflow_id: &str, reason: &str) -> Result<(), ClientError> {
        let snapshot = self.backend.load_snapshot(workflow_id).await?;
        if snapshot.is_terminal() {
            return Ok(());
        }
        self.backend.request_cancellation(workflow_id, reason).await?;
        tracing::info!(workflow_id = %workflow_id, reason = %reason, "Cancellation requested");
        Ok(())
    }
}

//! Storage abstraction for workflow runs, task queues and task claims.

use async_trait::async_trait;
use chrono::Duration;
use crystalflow_core::snapshot::WorkflowSnapshot;
use crystalflow_core::task_claim::{AvailableTask, TaskClaim};
use crystalflow_core::task_queue::{Capabilities, TaskQueue};

/// Error type for backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Snapshot, claim or task not found.
    #[error("Not found: {0}")]
    NotFound(String),
    /// A run with the same id already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Durable state shared by the client and every worker.
///
/// A backend stores one snapshot per run, one FIFO per task queue and the
/// claims workers hold on queued tasks. Cancellation requests are kept apart
/// from snapshots so a client never races a worker writing the same
/// snapshot.
#[async_trait]
pub trait PersistentBackend: Send + Sync {
    /// Store the snapshot of a new run.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::AlreadyExists` if the instance id is taken.
    async fn create_snapshot(&self, snapshot: WorkflowSnapshot) -> Result<(), BackendError>;

    /// Save a workflow snapshot, overwriting any previous version.
    async fn save_snapshot(&self, snapshot: WorkflowSnapshot) -> Result<(), BackendError>;

    /// Load a workflow snapshot by instance ID.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::NotFound` if no snapshot exists for the given instance ID.
    async fn load_snapshot(&self, instance_id: &str) -> Result<WorkflowSnapshot, BackendError>;

    /// Append a task to the queue named by `task.task_queue`.
    async fn enqueue_task(&self, task: AvailableTask) -> Result<(), BackendError>;

    /// Find tasks on `queue` that are due, unclaimed and executable with
    /// `capabilities`, oldest first.
    async fn find_available_tasks(
        &self,
        queue: TaskQueue,
        capabilities: &Capabilities,
        limit: usize,
    ) -> Result<Vec<AvailableTask>, BackendError>;

    /// Claim a task for execution by a worker.
    ///
    /// Returns `Ok(Some(claim))` if the claim was successful, `Ok(None)` if the
    /// task is already claimed by someone else or is no longer queued.
    async fn claim_task(
        &self,
        instance_id: &str,
        task_id: &str,
        worker_id: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<TaskClaim>, BackendError>;

    /// Release a task claim, making the task available to other workers.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::NotFound` if the claim doesn't exist and
    /// `BackendError::Backend` if it belongs to another worker.
    async fn release_task_claim(
        &self,
        instance_id: &str,
        task_id: &str,
        worker_id: &str,
    ) -> Result<(), BackendError>;

    /// Push a claim's expiry further out.
    async fn extend_task_claim(
        &self,
        instance_id: &str,
        task_id: &str,
        worker_id: &str,
        additional_duration: Duration,
    ) -> Result<(), BackendError>;

    /// Remove a finished task from its queue and drop its claim.
    async fn complete_task(&self, instance_id: &str, task_id: &str) -> Result<(), BackendError>;

    /// Ask for a run to be cancelled.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::NotFound` if the run does not exist.
    async fn request_cancellation(
        &self,
        instance_id: &str,
        reason: &str,
    ) -> Result<(), BackendError>;

    /// Pending cancellation reason for a run, if one was requested.
    async fn cancellation_reason(&self, instance_id: &str)
    -> Result<Option<String>, BackendError>;
}

//! Error types for crystalflow-core.

use crate::task_queue::TaskQueue;
use serde::{Deserialize, Serialize};

/// Configuration and registration errors.
///
/// These are raised while assembling registries, routing tables and workers,
/// before any work is polled.
#[derive(Debug)]
pub enum WorkflowError {
    /// The same activity or workflow name was registered twice.
    DuplicateRegistration(String),
    /// A referenced activity or workflow is not registered.
    NotRegistered(String),
    /// A workflow type or activity has no entry in the routing table.
    Unrouted(String),
    /// A worker registered something that is routed to a different queue.
    Misregistered {
        /// Registered workflow type or activity name.
        name: String,
        /// Queue the worker polls.
        worker_queue: TaskQueue,
        /// Queue the routing table assigns.
        routed_queue: TaskQueue,
    },
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowError::DuplicateRegistration(name) => {
                write!(f, "'{}' is already registered", name)
            }
            WorkflowError::NotRegistered(name) => write!(f, "'{}' is not registered", name),
            WorkflowError::Unrouted(name) => {
                write!(f, "'{}' has no task queue in the routing table", name)
            }
            WorkflowError::Misregistered {
                name,
                worker_queue,
                routed_queue,
            } => write!(
                f,
                "worker on '{}' registered '{}', which is routed to '{}'",
                worker_queue, name, routed_queue
            ),
        }
    }
}

impl std::error::Error for WorkflowError {}

/// Typed failure of a single activity attempt.
///
/// Activity failures are recorded in the run history, so the type is
/// serializable and carries only strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ActivityError {
    /// Malformed or missing input.
    #[error("validation error: {0}")]
    Validation(String),
    /// A local resource is absent and there is no remote source.
    #[error("not found: {0}")]
    NotFound(String),
    /// Remote fetch returned a non-success status or the transport failed.
    #[error("download error: {0}")]
    Download(String),
    /// The opaque computation raised an internal fault.
    #[error("computation error: {0}")]
    Computation(String),
    /// Results were computed but could not be written.
    #[error("persistence error: {0}")]
    Persistence(String),
    /// The activity exceeded its start-to-close timeout.
    #[error("timeout: {0}")]
    Timeout(String),
    /// The run was cancelled while the activity was pending or in flight.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// A payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
    /// Replayed workflow code diverged from the recorded history.
    #[error("nondeterministic workflow: {0}")]
    Nondeterministic(String),
}

impl ActivityError {
    /// Whether the engine may run the activity again after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ActivityError::Download(_) | ActivityError::Computation(_) | ActivityError::Timeout(_)
        )
    }

    /// Short machine-readable name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ActivityError::Validation(_) => "validation",
            ActivityError::NotFound(_) => "not_found",
            ActivityError::Download(_) => "download",
            ActivityError::Computation(_) => "computation",
            ActivityError::Persistence(_) => "persistence",
            ActivityError::Timeout(_) => "timeout",
            ActivityError::Cancelled(_) => "cancelled",
            ActivityError::Codec(_) => "codec",
            ActivityError::Nondeterministic(_) => "nondeterministic",
        }
    }
}

/// Terminal failure of one activity, as observed by workflow code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("activity '{activity}' failed after {attempts} attempt(s): {error}")]
pub struct ActivityFailure {
    pub activity: String,
    pub attempts: u32,
    pub error: ActivityError,
}

/// Terminal failure of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowFailure {
    /// Activity whose failure ended the run, if any.
    pub activity: Option<String>,
    /// Attempts made on that activity.
    pub attempts: u32,
    /// Original cause.
    pub error: ActivityError,
    /// Output that was already computed before the failing step.
    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub partial_output: Option<Vec<u8>>,
}

impl WorkflowFailure {
    /// A failure raised by workflow code itself rather than by an activity.
    pub fn new(error: ActivityError) -> Self {
        Self {
            activity: None,
            attempts: 0,
            error,
            partial_output: None,
        }
    }

    /// Attach output computed before the failing step.
    #[must_use]
    pub fn with_partial_output(mut self, output: impl Into<Vec<u8>>) -> Self {
        self.partial_output = Some(output.into());
        self
    }
}

impl std::fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.activity {
            Some(activity) => write!(
                f,
                "activity '{}' failed after {} attempt(s): {}",
                activity, self.attempts, self.error
            ),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for WorkflowFailure {}

impl From<ActivityFailure> for WorkflowFailure {
    fn from(failure: ActivityFailure) -> Self {
        Self {
            activity: Some(failure.activity),
            attempts: failure.attempts,
            error: failure.error,
            partial_output: None,
        }
    }
}

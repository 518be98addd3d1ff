//! Queued work items and the leases workers hold on them.
//!
//! A claim gives one worker exclusive rights to a task until it is
//! acknowledged, released or expires. Expiry lets another worker pick up the
//! task when its holder crashed.

use crate::task_queue::{Capabilities, TaskQueue};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A claim on a task by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClaim {
    /// The workflow run the task belongs to.
    pub instance_id: String,
    pub task_id: String,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
    /// `None` means the claim never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl TaskClaim {
    pub fn new(
        instance_id: String,
        task_id: String,
        worker_id: String,
        ttl: Option<Duration>,
    ) -> Self {
        let now = Utc::now();
        let expires_at = ttl.and_then(|duration| now.checked_add_signed(duration));
        Self {
            instance_id,
            task_id,
            worker_id,
            claimed_at: now,
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expires_at| Utc::now() >= expires_at)
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.worker_id == worker_id
    }
}

/// What a queued task asks a worker to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Replay the workflow and decide its next step.
    Workflow { workflow_type: String },
    /// Run one attempt of activity call `seq`.
    Activity {
        seq: u32,
        activity: String,
        attempt: u32,
    },
}

impl TaskKind {
    /// Registered name the worker needs in order to execute this task.
    pub fn name(&self) -> &str {
        match self {
            TaskKind::Workflow { workflow_type } => workflow_type,
            TaskKind::Activity { activity, .. } => activity,
        }
    }

    pub fn is_accepted_by(&self, capabilities: &Capabilities) -> bool {
        match self {
            TaskKind::Workflow { workflow_type } => capabilities.can_run_workflow(workflow_type),
            TaskKind::Activity { activity, .. } => capabilities.can_run_activity(activity),
        }
    }
}

/// A task waiting on a queue.
#[derive(Debug, Clone)]
pub struct AvailableTask {
    pub instance_id: String,
    pub task_id: String,
    pub task_queue: TaskQueue,
    pub kind: TaskKind,
    /// Encoded input (activity input or workflow input).
    pub input: Bytes,
    /// Earliest time the task may run; used for retry backoff.
    pub not_before: Option<DateTime<Utc>>,
}

impl AvailableTask {
    /// A workflow turn for the given run.
    pub fn workflow(
        instance_id: impl Into<String>,
        task_id: impl Into<String>,
        task_queue: TaskQueue,
        workflow_type: impl Into<String>,
        input: Bytes,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            task_id: task_id.into(),
            task_queue,
            kind: TaskKind::Workflow {
                workflow_type: workflow_type.into(),
            },
            input,
            not_before: None,
        }
    }

    /// Attempt `attempt` of activity call `seq`.
    pub fn activity(
        instance_id: impl Into<String>,
        task_queue: TaskQueue,
        seq: u32,
        activity: impl Into<String>,
        attempt: u32,
        input: Bytes,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            task_id: format!("activity-{seq}-{attempt}"),
            task_queue,
            kind: TaskKind::Activity {
                seq,
                activity: activity.into(),
                attempt,
            },
            input,
            not_before: None,
        }
    }

    #[must_use]
    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn is_due(&self) -> bool {
        self.not_before.is_none_or(|at| Utc::now() >= at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_without_ttl_never_expires() {
        let claim = TaskClaim::new("run".into(), "task".into(), "worker-1".into(), None);
        assert!(!claim.is_expired());
        assert!(claim.is_owned_by("worker-1"));
        assert!(!claim.is_owned_by("worker-2"));
    }

    #[test]
    fn zero_ttl_claim_is_expired() {
        let claim = TaskClaim::new(
            "run".into(),
            "task".into(),
            "worker-1".into(),
            Some(Duration::zero()),
        );
        assert!(claim.is_expired());
    }

    #[test]
    fn activity_task_ids_are_unique_per_attempt() {
        let first = AvailableTask::activity("run", TaskQueue::Gpu, 2, "run_inference", 1, Bytes::new());
        let retry = AvailableTask::activity("run", TaskQueue::Gpu, 2, "run_inference", 2, Bytes::new());
        assert_ne!(first.task_id, retry.task_id);
        assert_eq!(first.kind.name(), "run_inference");
    }

    #[test]
    fn delayed_task_is_not_due() {
        let task = AvailableTask::workflow("run", "workflow-0", TaskQueue::Cpu, "pubchem", Bytes::new())
            .not_before(Utc::now() + Duration::seconds(60));
        assert!(!task.is_due());
    }

    #[test]
    fn capabilities_gate_task_kinds() {
        let capabilities = Capabilities {
            workflows: ["pubchem".to_string()].into(),
            activities: ["run_lookup_query".to_string()].into(),
        };
        let lookup = TaskKind::Activity {
            seq: 1,
            activity: "run_lookup_query".into(),
            attempt: 1,
        };
        let inference = TaskKind::Workflow {
            workflow_type: "inference".into(),
        };
        assert!(lookup.is_accepted_by(&capabilities));
        assert!(!inference.is_accepted_by(&capabilities));
    }
}

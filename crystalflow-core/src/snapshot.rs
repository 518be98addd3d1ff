//! Durable record of one workflow run.
//!
//! A snapshot holds the run's encoded input, the ordered history of activity
//! events and the run state. Workflow turns are replayed from the history, so
//! the snapshot is everything needed to resume a run on any worker.

use crate::error::{ActivityFailure, WorkflowFailure};
use crate::task::ActivityOptions;
use crate::task_queue::TaskQueue;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of a run's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// Workflow code issued activity call number `seq`.
    ActivityScheduled {
        seq: u32,
        activity: String,
        task_queue: TaskQueue,
        options: ActivityOptions,
        #[serde(with = "serde_bytes")]
        input: Vec<u8>,
    },
    /// Activity call `seq` produced an output.
    ActivityCompleted {
        seq: u32,
        attempts: u32,
        #[serde(with = "serde_bytes")]
        output: Vec<u8>,
    },
    /// Activity call `seq` failed terminally (retries exhausted or not allowed).
    ActivityFailed { seq: u32, failure: ActivityFailure },
}

impl HistoryEvent {
    pub fn seq(&self) -> u32 {
        match self {
            HistoryEvent::ActivityScheduled { seq, .. }
            | HistoryEvent::ActivityCompleted { seq, .. }
            | HistoryEvent::ActivityFailed { seq, .. } => *seq,
        }
    }
}

/// State of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowSnapshotState {
    Running,
    Completed {
        #[serde(with = "serde_bytes")]
        final_output: Vec<u8>,
    },
    Failed {
        failure: WorkflowFailure,
    },
    Cancelled {
        reason: String,
    },
}

/// A complete, resumable record of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Unique identifier of the run (the workflow handle).
    pub instance_id: String,
    /// Registered workflow type executing this run.
    pub workflow_type: String,
    /// Queue the run's workflow turns are dispatched on.
    pub task_queue: TaskQueue,
    pub state: WorkflowSnapshotState,
    pub history: Vec<HistoryEvent>,
    #[serde(with = "serde_bytes")]
    pub initial_input: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSnapshot {
    /// Create the snapshot of a freshly started run.
    pub fn new(
        instance_id: impl Into<String>,
        workflow_type: impl Into<String>,
        task_queue: TaskQueue,
        initial_input: Bytes,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            workflow_type: workflow_type.into(),
            task_queue,
            state: WorkflowSnapshotState::Running,
            history: Vec::new(),
            initial_input: initial_input.to_vec(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn initial_input_bytes(&self) -> Bytes {
        Bytes::from(self.initial_input.clone())
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, WorkflowSnapshotState::Running)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, WorkflowSnapshotState::Failed { .. })
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_running()
    }

    /// Identifier for the next workflow turn task.
    ///
    /// Each turn follows a history change, so the history length makes the
    /// id unique within the run.
    pub fn next_workflow_task_id(&self) -> String {
        format!("workflow-{}", self.history.len())
    }

    /// Number of activities that completed successfully.
    pub fn completed_activities(&self) -> usize {
        self.history
            .iter()
            .filter(|event| matches!(event, HistoryEvent::ActivityCompleted { .. }))
            .count()
    }

    /// Scheduled event for activity call `seq`.
    pub fn scheduled_activity(&self, seq: u32) -> Option<&HistoryEvent> {
        self.history.iter().find(|event| {
            matches!(event, HistoryEvent::ActivityScheduled { seq: s, .. } if *s == seq)
        })
    }

    /// Whether activity call `seq` already has a completion or failure.
    pub fn is_activity_resolved(&self, seq: u32) -> bool {
        self.history.iter().any(|event| {
            matches!(
                event,
                HistoryEvent::ActivityCompleted { seq: s, .. }
                    | HistoryEvent::ActivityFailed { seq: s, .. } if *s == seq
            )
        })
    }

    /// Name of the activity currently awaiting a result, if any.
    pub fn pending_activity(&self) -> Option<&str> {
        self.history.iter().rev().find_map(|event| match event {
            HistoryEvent::ActivityScheduled { seq, activity, .. }
                if !self.is_activity_resolved(*seq) =>
            {
                Some(activity.as_str())
            }
            _ => None,
        })
    }

    pub fn record_activity_scheduled(
        &mut self,
        seq: u32,
        activity: String,
        task_queue: TaskQueue,
        options: ActivityOptions,
        input: Bytes,
    ) {
        self.push(HistoryEvent::ActivityScheduled {
            seq,
            activity,
            task_queue,
            options,
            input: input.to_vec(),
        });
    }

    pub fn record_activity_completed(&mut self, seq: u32, attempts: u32, output: Bytes) {
        self.push(HistoryEvent::ActivityCompleted {
            seq,
            attempts,
            output: output.to_vec(),
        });
    }

    pub fn record_activity_failed(&mut self, seq: u32, failure: ActivityFailure) {
        self.push(HistoryEvent::ActivityFailed { seq, failure });
    }

    fn push(&mut self, event: HistoryEvent) {
        self.history.push(event);
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self, final_output: Bytes) {
        self.state = WorkflowSnapshotState::Completed {
            final_output: final_output.to_vec(),
        };
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, failure: WorkflowFailure) {
        self.state = WorkflowSnapshotState::Failed { failure };
        self.updated_at = Utc::now();
    }

    pub fn mark_cancelled(&mut self, reason: impl Into<String>) {
        self.state = WorkflowSnapshotState::Cancelled {
            reason: reason.into(),
        };
        self.updated_at = Utc::now();
    }

    /// Final output, if the run completed.
    pub fn final_output_bytes(&self) -> Option<Bytes> {
        match &self.state {
            WorkflowSnapshotState::Completed { final_output } => {
                Some(Bytes::from(final_output.clone()))
            }
            _ => None,
        }
    }
}

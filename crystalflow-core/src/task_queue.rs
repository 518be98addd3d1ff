//! Task queues and the static routing table.
//!
//! A task queue is a routing label connecting workflow runs and their
//! activities to the worker pools able to execute them. The set of queues is
//! closed; the routing table is built once at startup and never mutated.

use crate::error::WorkflowError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Display};

/// Capability class of a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskQueue {
    /// CPU-bound work such as remote data lookups.
    #[serde(rename = "cpu-queue")]
    Cpu,
    /// Work that needs a GPU-capable host, such as model inference.
    #[serde(rename = "gpu-queue")]
    Gpu,
}

impl TaskQueue {
    /// Wire name of the queue.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskQueue::Cpu => "cpu-queue",
            TaskQueue::Gpu => "gpu-queue",
        }
    }
}

impl Display for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker declared it can execute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub workflows: BTreeSet<String>,
    pub activities: BTreeSet<String>,
}

impl Capabilities {
    pub fn can_run_workflow(&self, workflow_type: &str) -> bool {
        self.workflows.contains(workflow_type)
    }

    pub fn can_run_activity(&self, activity: &str) -> bool {
        self.activities.contains(activity)
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty() && self.activities.is_empty()
    }
}

/// Static routing table: workflow type / activity name → task queue.
///
/// # Example
///
/// ```
/// use crystalflow_core::task_queue::{TaskQueue, TaskQueueRegistry};
///
/// let routing = TaskQueueRegistry::builder()
///     .route_workflow("pubchem", TaskQueue::Cpu)
///     .route_activity("run_lookup_query", TaskQueue::Cpu)
///     .build()
///     .unwrap();
/// assert_eq!(routing.queue_for_workflow("pubchem").unwrap(), TaskQueue::Cpu);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TaskQueueRegistry {
    workflows: HashMap<String, TaskQueue>,
    activities: HashMap<String, TaskQueue>,
}

impl TaskQueueRegistry {
    pub fn builder() -> TaskQueueRegistryBuilder {
        TaskQueueRegistryBuilder::default()
    }

    /// Queue a workflow type is pinned to.
    pub fn queue_for_workflow(&self, workflow_type: &str) -> Result<TaskQueue, WorkflowError> {
        self.workflows
            .get(workflow_type)
            .copied()
            .ok_or_else(|| WorkflowError::Unrouted(workflow_type.to_string()))
    }

    /// Queue an activity is pinned to.
    pub fn queue_for_activity(&self, activity: &str) -> Result<TaskQueue, WorkflowError> {
        self.activities
            .get(activity)
            .copied()
            .ok_or_else(|| WorkflowError::Unrouted(activity.to_string()))
    }

    /// Check a worker's registrations against the table.
    ///
    /// Every workflow type and activity the worker registered must be routed
    /// to the queue it polls.
    pub fn verify_worker(
        &self,
        queue: TaskQueue,
        capabilities: &Capabilities,
    ) -> Result<(), WorkflowError> {
        let workflows = capabilities
            .workflows
            .iter()
            .map(|name| (name, self.queue_for_workflow(name)));
        let activities = capabilities
            .activities
            .iter()
            .map(|name| (name, self.queue_for_activity(name)));

        for (name, routed) in workflows.chain(activities) {
            let routed_queue = routed?;
            if routed_queue != queue {
                return Err(WorkflowError::Misregistered {
                    name: name.clone(),
                    worker_queue: queue,
                    routed_queue,
                });
            }
        }
        Ok(())
    }
}

/// Builder for [`TaskQueueRegistry`].
#[derive(Debug, Default)]
pub struct TaskQueueRegistryBuilder {
    workflows: Vec<(String, TaskQueue)>,
    activities: Vec<(String, TaskQueue)>,
}

impl TaskQueueRegistryBuilder {
    #[must_use]
    pub fn route_workflow(mut self, workflow_type: &str, queue: TaskQueue) -> Self {
        self.workflows.push((workflow_type.to_string(), queue));
        self
    }

    #[must_use]
    pub fn route_activity(mut self, activity: &str, queue: TaskQueue) -> Self {
        self.activities.push((activity.to_string(), queue));
        self
    }

    /// Build the table, rejecting names routed more than once.
    pub fn build(self) -> Result<TaskQueueRegistry, WorkflowError> {
        let mut registry = TaskQueueRegistry::default();
        for (name, queue) in self.workflows {
            if registry.workflows.insert(name.clone(), queue).is_some() {
                return Err(WorkflowError::DuplicateRegistration(name));
            }
        }
        for (name, queue) in self.activities {
            if registry.activities.insert(name.clone(), queue).is_some() {
                return Err(WorkflowError::DuplicateRegistration(name));
            }
        }
        Ok(registry)
    }
}

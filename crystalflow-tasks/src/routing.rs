//! Static routing table: which queue runs each workflow type and activity.

use crate::activities::{
    GET_OR_DOWNLOAD_MODEL, PERSIST_RESULTS, RESOLVE_PROMPT_INPUT, RUN_INFERENCE, RUN_LOOKUP_QUERY,
};
use crate::workflows::{INFERENCE_WORKFLOW, PUBCHEM_WORKFLOW};
use crystalflow_core::{TaskQueue, TaskQueueRegistry, WorkflowError};

/// Activities of the inference workflow, all on the gpu queue.
pub const INFERENCE_ACTIVITIES: [&str; 4] = [
    GET_OR_DOWNLOAD_MODEL,
    RESOLVE_PROMPT_INPUT,
    RUN_INFERENCE,
    PERSIST_RESULTS,
];

pub fn task_queues() -> Result<TaskQueueRegistry, WorkflowError> {
    INFERENCE_ACTIVITIES
        .iter()
        .fold(
            TaskQueueRegistry::builder().route_workflow(INFERENCE_WORKFLOW, TaskQueue::Gpu),
            |builder, activity| builder.route_activity(activity, TaskQueue::Gpu),
        )
        .route_workflow(PUBCHEM_WORKFLOW, TaskQueue::Cpu)
        .route_activity(RUN_LOOKUP_QUERY, TaskQueue::Cpu)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_runs_on_gpu_and_lookup_on_cpu() {
        let routing = task_queues().unwrap();

        assert_eq!(routing.queue_for_workflow(INFERENCE_WORKFLOW).unwrap(), TaskQueue::Gpu);
        for activity in INFERENCE_ACTIVITIES {
            assert_eq!(routing.queue_for_activity(activity).unwrap(), TaskQueue::Gpu);
        }
        assert_eq!(routing.queue_for_workflow(PUBCHEM_WORKFLOW).unwrap(), TaskQueue::Cpu);
        assert_eq!(routing.queue_for_activity(RUN_LOOKUP_QUERY).unwrap(), TaskQueue::Cpu);
    }

    #[test]
    fn unknown_names_are_unrouted() {
        let routing = task_queues().unwrap();
        assert!(matches!(
            routing.queue_for_activity("train_model"),
            Err(WorkflowError::Unrouted(_))
        ));
    }
}

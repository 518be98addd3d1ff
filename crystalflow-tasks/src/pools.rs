//! Worker pools for the two task queues.

use crate::activities::{InferenceActivities, LookupActivities};
use crate::workflows::{inference_workflows, pubchem_workflows};
use crystalflow_core::{JsonCodec, TaskQueue, TaskQueueRegistry, WorkflowError};
use crystalflow_persistence::PersistentBackend;
use crystalflow_runtime::PooledWorker;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

/// Settings shared by both pools.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub concurrency: NonZeroUsize,
    pub poll_interval: Duration,
}

/// Pool on `gpu-queue`: the inference workflow and its activities.
pub fn gpu_pool<B: PersistentBackend + 'static>(
    backend: B,
    codec: Arc<JsonCodec>,
    routing: Arc<TaskQueueRegistry>,
    activities: Arc<InferenceActivities>,
    settings: &PoolSettings,
) -> Result<PooledWorker<B, JsonCodec>, WorkflowError> {
    let registry = activities.registry(Arc::clone(&codec))?;
    Ok(
        PooledWorker::new("gpu-worker", TaskQueue::Gpu, backend, codec, routing)
            .with_workflows(inference_workflows()?)
            .with_activities(registry)
            .with_poll_interval(settings.poll_interval)
            .with_batch_size(settings.concurrency)
            .with_max_concurrency(settings.concurrency),
    )
}

/// Pool on `cpu-queue`: the lookup workflow and its activity.
pub fn cpu_pool<B: PersistentBackend + 'static>(
    backend: B,
    codec: Arc<JsonCodec>,
    routing: Arc<TaskQueueRegistry>,
    activities: Arc<LookupActivities>,
    settings: &PoolSettings,
) -> Result<PooledWorker<B, JsonCodec>, WorkflowError> {
    let registry = activities.registry(Arc::clone(&codec))?;
    Ok(
        PooledWorker::new("cpu-worker", TaskQueue::Cpu, backend, codec, routing)
            .with_workflows(pubchem_workflows()?)
            .with_activities(registry)
            .with_poll_interval(settings.poll_interval)
            .with_batch_size(settings.concurrency)
            .with_max_concurrency(settings.concurrency),
    )
}

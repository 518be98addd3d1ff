//! Application state for API handlers

use crystalflow_core::JsonCodec;
use crystalflow_persistence::InMemoryBackend;
use crystalflow_runtime::WorkflowClient;
use std::time::Duration;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Client of the engine the worker pools poll
    pub client: WorkflowClient<InMemoryBackend, JsonCodec>,

    /// How long `GET /get-result` waits for a run to finish
    pub result_timeout: Duration,
}

impl AppState {
    pub fn new(client: WorkflowClient<InMemoryBackend, JsonCodec>, result_timeout: Duration) -> Self {
        Self {
            client,
            result_timeout,
        }
    }
}

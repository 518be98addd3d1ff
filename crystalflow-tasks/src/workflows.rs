//! Workflow definitions.
//!
//! Workflow code only awaits activities through its [`WorkflowContext`]; it
//! performs no I/O of its own, so it can be replayed from history on any
//! worker of its queue.

use crate::activities::{
    GET_OR_DOWNLOAD_MODEL, PERSIST_RESULTS, RESOLVE_PROMPT_INPUT, RUN_INFERENCE, RUN_LOOKUP_QUERY,
};
use crate::types::{
    FetchModel, InferenceJob, InferenceRequest, LookupRequest, ModelDescriptor, PersistRequest,
    PromptSource,
};
use crystalflow_core::codec::Encoder;
use crystalflow_core::{
    ActivityOptions, JsonCodec, RetryPolicy, WorkflowContext, WorkflowError, WorkflowFailure,
    WorkflowRegistry,
};
use crystalflow_runtime::WorkflowStatus;
use serde::Serialize;
use std::time::Duration;

pub const INFERENCE_WORKFLOW: &str = "inference";
pub const PUBCHEM_WORKFLOW: &str = "pubchem";

/// Progress of an inference run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceStage {
    FetchingModel,
    ResolvingPrompt,
    Generating,
    Persisting,
    Completed,
    Failed,
}

impl InferenceStage {
    /// Stage during which `activity` runs.
    pub fn for_activity(activity: &str) -> Option<Self> {
        match activity {
            GET_OR_DOWNLOAD_MODEL => Some(Self::FetchingModel),
            RESOLVE_PROMPT_INPUT => Some(Self::ResolvingPrompt),
            RUN_INFERENCE => Some(Self::Generating),
            PERSIST_RESULTS => Some(Self::Persisting),
            _ => None,
        }
    }

    /// Stage of a run given its status and the activity it waits on.
    ///
    /// Between activities (a workflow turn is queued) the stage is the one
    /// the next call starts, derived from the number of completed calls.
    pub fn from_progress(
        status: WorkflowStatus,
        pending_activity: Option<&str>,
        completed_activities: usize,
    ) -> Self {
        match status {
            WorkflowStatus::Completed => Self::Completed,
            WorkflowStatus::Failed | WorkflowStatus::Cancelled => Self::Failed,
            WorkflowStatus::Running => pending_activity
                .and_then(Self::for_activity)
                .unwrap_or(match completed_activities {
                    0 => Self::FetchingModel,
                    1 => Self::ResolvingPrompt,
                    2 => Self::Generating,
                    _ => Self::Persisting,
                }),
        }
    }
}

fn fetch_options() -> ActivityOptions {
    ActivityOptions::with_timeout(Duration::from_secs(120))
}

fn prompt_options() -> ActivityOptions {
    ActivityOptions::with_timeout(Duration::from_secs(60))
}

fn inference_options() -> ActivityOptions {
    ActivityOptions::with_timeout(Duration::from_secs(10 * 60))
}

fn persist_options() -> ActivityOptions {
    ActivityOptions::with_timeout(Duration::from_secs(60)).retry_policy(RetryPolicy::no_retry())
}

fn lookup_options() -> ActivityOptions {
    ActivityOptions::with_timeout(Duration::from_secs(10))
}

/// Fetch the model, resolve the prompt, generate samples and persist them.
///
/// A persistence failure keeps the generated samples as the failure's
/// partial output.
pub async fn inference_workflow(
    ctx: WorkflowContext<JsonCodec>,
    request: InferenceRequest,
) -> Result<Vec<String>, WorkflowFailure> {
    let model: ModelDescriptor = ctx
        .execute_activity(
            GET_OR_DOWNLOAD_MODEL,
            &FetchModel {
                model_path: request.model_path.clone(),
                model_url: request.model_url.clone(),
            },
            fetch_options(),
        )
        .await?;

    let prompt: String = ctx
        .execute_activity(
            RESOLVE_PROMPT_INPUT,
            &PromptSource {
                raw_input: request.raw_input.clone(),
                input_file: request.input_file.clone(),
            },
            prompt_options(),
        )
        .await?;

    let samples: Vec<String> = ctx
        .execute_activity(
            RUN_INFERENCE,
            &InferenceJob {
                model,
                prompt,
                params: request.params.clone(),
            },
            inference_options(),
        )
        .await?;

    let persisted: Result<(), _> = ctx
        .execute_activity(
            PERSIST_RESULTS,
            &PersistRequest {
                run_id: ctx.workflow_id().to_string(),
                samples: samples.clone(),
                generate_cif: request.generate_cif,
            },
            persist_options(),
        )
        .await;

    match persisted {
        Ok(()) => Ok(samples),
        Err(failure) => {
            let failure = WorkflowFailure::from(failure);
            Err(match ctx.codec().encode(&samples) {
                Ok(encoded) => failure.with_partial_output(encoded.to_vec()),
                Err(_) => failure,
            })
        }
    }
}

/// Single lookup query, result or failure passed through unchanged.
pub async fn pubchem_workflow(
    ctx: WorkflowContext<JsonCodec>,
    request: LookupRequest,
) -> Result<String, WorkflowFailure> {
    let answer: String = ctx
        .execute_activity(RUN_LOOKUP_QUERY, &request, lookup_options())
        .await?;
    Ok(answer)
}

pub fn inference_workflows() -> Result<WorkflowRegistry<JsonCodec>, WorkflowError> {
    let mut workflows = WorkflowRegistry::new();
    workflows.register_fn(INFERENCE_WORKFLOW, inference_workflow)?;
    Ok(workflows)
}

pub fn pubchem_workflows() -> Result<WorkflowRegistry<JsonCodec>, WorkflowError> {
    let mut workflows = WorkflowRegistry::new();
    workflows.register_fn(PUBCHEM_WORKFLOW, pubchem_workflow)?;
    Ok(workflows)
}

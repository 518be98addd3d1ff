//! Request handlers

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::types::{InferenceRequest, LookupRequest};
use crate::workflows::{INFERENCE_WORKFLOW, InferenceStage, PUBCHEM_WORKFLOW};
use axum::{
    Json,
    extract::{Path, State},
};
use crystalflow_runtime::{ClientError, WorkflowDescription, WorkflowOutcome};
use serde::Serialize;
use uuid::Uuid;

/// Response of the start endpoints
#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub workflow_id: String,
}

/// Response of `GET /get-result/{workflow_id}`
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ResultResponse {
    Completed {
        workflow_id: String,
        result: serde_json::Value,
    },
    NotCompleted {
        workflow_id: String,
        status: &'static str,
        detail: String,
        /// Output produced before the step that failed.
        #[serde(skip_serializing_if = "Option::is_none")]
        partial_result: Option<serde_json::Value>,
    },
}

impl ResultResponse {
    fn not_completed(workflow_id: String, detail: String) -> Self {
        ResultResponse::NotCompleted {
            workflow_id,
            status: "not completed",
            detail,
            partial_result: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub workflow_id: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub run: WorkflowDescription,
    /// Set for inference runs only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<InferenceStage>,
}

/// Start an inference run on the gpu queue
pub async fn start_inference_task(
    State(state): State<AppState>,
    Json(request): Json<InferenceRequest>,
) -> ApiResult<Json<StartResponse>> {
    let workflow_id = format!("inference-workflow-{}", Uuid::new_v4());
    let handle = state
        .client
        .start_workflow(INFERENCE_WORKFLOW, &workflow_id, &request)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(StartResponse {
        workflow_id: handle.workflow_id,
    }))
}

/// Start a molecule lookup on the cpu queue
pub async fn start_pubchem_task(
    State(state): State<AppState>,
    Json(request): Json<LookupRequest>,
) -> ApiResult<Json<StartResponse>> {
    let workflow_id = format!("pubchem-workflow-{}", Uuid::new_v4());
    let handle = state
        .client
        .start_workflow(PUBCHEM_WORKFLOW, &workflow_id, &request)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(StartResponse {
        workflow_id: handle.workflow_id,
    }))
}

/// Wait for a run to finish and report its result
///
/// Anything other than a completed run is reported as "not completed" with
/// the reason in `detail`.
pub async fn get_result(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Json<ResultResponse> {
    let outcome = state
        .client
        .get_result::<serde_json::Value>(&workflow_id, state.result_timeout)
        .await;

    let response = match outcome {
        Ok(WorkflowOutcome::Completed(result)) => ResultResponse::Completed {
            workflow_id,
            result,
        },
        Ok(WorkflowOutcome::Failed(failure)) => {
            let partial_result = failure
                .partial_output
                .as_deref()
                .and_then(|bytes| serde_json::from_slice(bytes).ok());
            ResultResponse::NotCompleted {
                workflow_id,
                status: "not completed",
                detail: failure.to_string(),
                partial_result,
            }
        }
        Ok(WorkflowOutcome::Cancelled(reason)) => {
            ResultResponse::not_completed(workflow_id, format!("cancelled: {}", reason))
        }
        Err(ClientError::Timeout(_)) => ResultResponse::not_completed(
            workflow_id,
            format!(
                "still running after {}s",
                state.result_timeout.as_secs()
            ),
        ),
        Err(err) => {
            tracing::debug!(workflow_id = %workflow_id, error = %err, "Result unavailable");
            ResultResponse::not_completed(workflow_id, err.to_string())
        }
    };

    Json(response)
}

/// Request cancellation of a run
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    state
        .client
        .cancel(&workflow_id, "cancelled through the API")
        .await?;

    Ok(Json(CancelResponse {
        workflow_id,
        status: "cancellation requested",
    }))
}

/// Current state of a run
pub async fn workflow_status(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let run = state.client.describe(&workflow_id).await?;
    let stage = (run.workflow_type == INFERENCE_WORKFLOW).then(|| {
        InferenceStage::from_progress(
            run.status,
            run.pending_activity.as_deref(),
            run.completed_activities,
        )
    });

    Ok(Json(StatusResponse { run, stage }))
}

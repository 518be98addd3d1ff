//! API Router configuration

use super::handlers;
use super::state::AppState;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/start-inference-task", post(handlers::start_inference_task))
        .route("/start-pubchem-task", post(handlers::start_pubchem_task))
        .route("/get-result/:workflow_id", get(handlers::get_result))
        .route("/cancel-task/:workflow_id", post(handlers::cancel_task))
        .route("/status/:workflow_id", get(handlers::workflow_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Completion callbacks and run submission
///
/// `POST /taskInstanceExecution/{id}/end` is where a remote node delivers the
/// result of a dispatched SERVICE task; `POST /workflow/{id}/execute` submits
/// a new run of a local workflow.

use crate::api::{internal_error, AppState};
use crate::runtime::service::{complete_service_execution, CompletionRequest};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// `POST /workflow/{id}/execute` request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteWorkflowRequest {
    #[serde(default)]
    pub data_id: Option<i64>,
}

/// `POST /workflow/{id}/execute` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteWorkflowResponse {
    pub id: i64,
    pub workflow_id: i64,
    pub data_id: Option<i64>,
}

pub fn create_callback_routes() -> Router<AppState> {
    Router::new()
        .route("/taskInstanceExecution/{id}/end", post(end_task_instance_execution))
        .route("/workflow/{id}/execute", post(execute_workflow))
}

/// Resolve a pending SERVICE row with the remote output
async fn end_task_instance_execution(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<CompletionRequest>,
) -> Result<Json<Value>, StatusCode> {
    tracing::info!("📥 Completion received for task instance execution {}", id);

    let success = complete_service_execution(&state.ctx, id, request.values)
        .await
        .map_err(|e| internal_error(&format!("Completion of task instance execution {} failed", id), e))?;
    if !success {
        tracing::warn!("⚠️ Completion for task instance execution {} had no effect", id);
    }
    Ok(Json(json!({ "success": success })))
}

/// Insert a LOADED run; the driver loop starts it on a later tick
async fn execute_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
    Json(request): Json<ExecuteWorkflowRequest>,
) -> Result<Json<ExecuteWorkflowResponse>, StatusCode> {
    let store = &state.ctx.store;

    let workflow = store
        .get_workflow(workflow_id)
        .await
        .map_err(|e| internal_error("Workflow lookup failed", e))?;
    if workflow.is_none() {
        tracing::warn!("❌ Execution requested for unknown workflow {}", workflow_id);
        return Err(StatusCode::NOT_FOUND);
    }
    if let Some(data_id) = request.data_id {
        let data = store
            .get_data(data_id)
            .await
            .map_err(|e| internal_error("Data lookup failed", e))?;
        if data.is_none() {
            tracing::warn!("❌ Execution of workflow {} requested with unknown data {}", workflow_id, data_id);
            return Err(StatusCode::NOT_FOUND);
        }
    }

    let id = store
        .insert_workflow_execution(workflow_id, request.data_id, &[])
        .await
        .map_err(|e| internal_error("Failed to submit workflow execution", e))?;
    tracing::info!("📥 Submitted workflow execution {} of workflow {}", id, workflow_id);

    Ok(Json(ExecuteWorkflowResponse {
        id,
        workflow_id,
        data_id: request.data_id,
    }))
}

/// Service node endpoints
///
/// The surface another engine talks to when it dispatches a SERVICE task to
/// this one: queue depth for node selection, start, status for polling and
/// explicit cancellation.

use crate::api::{internal_error, AppState};
use crate::datatype::codec::canonical_values;
use crate::runtime::service::{QueueCount, ServiceExecutionStatus, StartServiceRequest, StartServiceResponse};
use crate::workflow::params;
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{Extensions, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;

pub fn create_service_routes() -> Router<AppState> {
    Router::new()
        .route("/queueCount", get(queue_count))
        .route("/service/{service_id}/start", post(start_service))
        .route("/service/execution/{id}", get(service_execution))
        .route("/service/execution/{id}/kill", post(kill_service_execution))
}

/// Runs between QUEUED and STARTED on this engine
async fn queue_count(State(state): State<AppState>) -> Result<Json<QueueCount>, StatusCode> {
    let count = state
        .ctx
        .store
        .count_active_workflow_executions()
        .await
        .map_err(|e| internal_error("Failed to count workflow executions", e))?;
    Ok(Json(QueueCount { count }))
}

/// Store the caller's values and submit a run of the service's workflow
async fn start_service(
    State(state): State<AppState>,
    Path(service_id): Path<i64>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(request): Json<StartServiceRequest>,
) -> Result<Json<StartServiceResponse>, StatusCode> {
    let store = &state.ctx.store;

    let service = store
        .get_service(service_id)
        .await
        .map_err(|e| internal_error("Service lookup failed", e))?
        .ok_or_else(|| {
            tracing::warn!("❌ Start requested for unknown service {}", service_id);
            StatusCode::NOT_FOUND
        })?;
    let workflow = store
        .require_workflow(service.workflow_id)
        .await
        .map_err(|e| internal_error("Service workflow lookup failed", e))?;

    let remote_addr = request
        .call_back_addr
        .clone()
        .or_else(|| forwarded_for(&headers))
        .or_else(|| {
            extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        });

    let values = canonical_values(&state.ctx.types(), workflow.input_data_type_id, &request.values)
        .map_err(|e| internal_error(&format!("Service {} input rejected", service_id), e))?;

    let title = format!("{}#{} Input", service.title, workflow.id);
    let data_id = store
        .save_data(workflow.input_data_type_id, &values, &title)
        .await
        .map_err(|e| internal_error("Failed to store service input", e))?;

    let mut run_params = vec![(params::CALL_BACK, request.call_back.clone())];
    if let Some(addr) = remote_addr {
        run_params.push((params::REMOTE_ADDR, addr));
    } else {
        tracing::warn!("⚠️ Service {} started without a callback address", service_id);
    }

    let workflow_execution_id = store
        .insert_workflow_execution(workflow.id, Some(data_id), &run_params)
        .await
        .map_err(|e| internal_error("Failed to submit service workflow execution", e))?;
    tracing::info!(
        "📥 Service '{}' started workflow execution {} (workflow {})",
        service.title,
        workflow_execution_id,
        workflow.id
    );

    Ok(Json(StartServiceResponse {
        workflow_execution_id,
        title,
    }))
}

/// First address of `X-Forwarded-For`
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .map(str::trim)
        .find(|addr| !addr.is_empty())
        .map(str::to_string)
}

/// State of a run, with its output once finished
async fn service_execution(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ServiceExecutionStatus>, StatusCode> {
    let store = &state.ctx.store;
    let execution = store
        .get_workflow_execution(id)
        .await
        .map_err(|e| internal_error("Workflow execution lookup failed", e))?
        .ok_or(StatusCode::NOT_FOUND)?;

    let output_data_values = match (execution.state.is_finished(), execution.output_data_id) {
        (true, Some(data_id)) => store
            .get_data(data_id)
            .await
            .map_err(|e| internal_error("Output lookup failed", e))?
            .map(|data| data.values),
        _ => None,
    };

    Ok(Json(ServiceExecutionStatus {
        workflow_execution_id: execution.id,
        execution_state: execution.state,
        entry_time: Some(execution.entry_time),
        start_time: execution.start_time,
        end_time: execution.end_time,
        output_data_values,
    }))
}

/// Cancel an unfinished run and every one of its task instance executions
async fn kill_service_execution(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Value>, StatusCode> {
    let store = &state.ctx.store;
    let execution = store
        .get_workflow_execution(id)
        .await
        .map_err(|e| internal_error("Workflow execution lookup failed", e))?;
    if execution.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    let killed = store
        .kill_workflow_execution(id)
        .await
        .map_err(|e| internal_error(&format!("Failed to kill workflow execution {}", id), e))?;
    if !killed {
        tracing::warn!("⚠️ Workflow execution {} already finished, not killed", id);
        return Err(StatusCode::CONFLICT);
    }
    tracing::info!("🛑 Workflow execution {} killed", id);
    Ok(Json(json!({ "success": true })))
}

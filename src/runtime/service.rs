/// Remote service dispatch and completion
///
/// A SERVICE task is sent to the least busy node advertising its uniform
/// service id and stays STARTED until the remote run finishes. Completion
/// arrives either as an inbound callback or through polling the node; both
/// paths end in [`complete_service_execution`], whose STARTED -> ENDED
/// compare-and-set makes a second completion a no-op.

use crate::datatype::codec::canonical_values;
use crate::datatype::Data;
use crate::error::{EngineError, Result};
use crate::runtime::context::EngineContext;
use crate::workflow::storage::ServiceEndpoint;
use crate::workflow::{params, ExecutionState, Task, TaskInstanceExecution};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `GET /queueCount` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCount {
    pub count: i64,
}

/// `POST /service/{id}/start` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartServiceRequest {
    pub values: Vec<String>,
    pub call_back: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_back_addr: Option<String>,
}

/// `POST /service/{id}/start` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartServiceResponse {
    pub workflow_execution_id: i64,
    #[serde(default)]
    pub title: String,
}

/// `GET /service/execution/{id}` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExecutionStatus {
    pub workflow_execution_id: i64,
    pub execution_state: ExecutionState,
    #[serde(default)]
    pub entry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data_values: Option<Vec<String>>,
}

/// Body of a completion callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub values: Vec<String>,
}

/// Path a remote node POSTs the result of a dispatched execution to
pub fn callback_path(task_instance_execution_id: i64) -> String {
    format!("/taskInstanceExecution/{}/end", task_instance_execution_id)
}

/// Hand a SERVICE task to the least busy node; the row stays STARTED
pub async fn dispatch_service(
    ctx: &EngineContext,
    task: &Task,
    execution: &TaskInstanceExecution,
    input: &Data,
) -> Result<()> {
    let uniform_service_id = task.require_param(params::UNIFORM_SERVICE_ID)?;
    let endpoints = ctx.store.service_endpoints(uniform_service_id).await?;
    let endpoint = least_busy_endpoint(ctx, &endpoints).await.ok_or_else(|| {
        EngineError::Dispatch(format!(
            "no reachable node offers service '{}' ({} known)",
            uniform_service_id,
            endpoints.len()
        ))
    })?;

    let url = format!(
        "{}/service/{}/start",
        endpoint.node.ip_address.trim_end_matches('/'),
        endpoint.node_service_id
    );
    let request = StartServiceRequest {
        values: input.values.clone(),
        call_back: callback_path(execution.id),
        call_back_addr: Some(ctx.advertise_addr.clone()),
    };
    tracing::debug!("🌍 Starting remote service: POST {}", url);

    let response = ctx.http.post(&url).json(&request).send().await?;
    if !response.status().is_success() {
        return Err(EngineError::Dispatch(format!("{} answered {}", url, response.status())));
    }
    let started: StartServiceResponse = response.json().await?;

    ctx.store
        .insert_task_instance_execution_params(
            execution.id,
            &[
                (params::IP_ADDRESS, endpoint.node.ip_address.clone()),
                (params::REMOTE_EXECUTION_ID, started.workflow_execution_id.to_string()),
            ],
        )
        .await?;

    tracing::info!(
        "📡 Task instance execution {} dispatched to node {} as remote execution {}",
        execution.id,
        endpoint.node.title,
        started.workflow_execution_id
    );
    Ok(())
}

/// Minimum queue count wins, ties go to the first node; unreachable nodes are skipped
async fn least_busy_endpoint<'a>(ctx: &EngineContext, endpoints: &'a [ServiceEndpoint]) -> Option<&'a ServiceEndpoint> {
    let mut best: Option<(&ServiceEndpoint, i64)> = None;
    for endpoint in endpoints {
        match queue_count(ctx, &endpoint.node.ip_address).await {
            Ok(count) => {
                if best.map_or(true, |(_, min)| count < min) {
                    best = Some((endpoint, count));
                }
            }
            Err(e) => {
                tracing::warn!("⚠️ Node {} skipped, queue count unavailable: {}", endpoint.node.ip_address, e);
            }
        }
    }
    best.map(|(endpoint, _)| endpoint)
}

async fn queue_count(ctx: &EngineContext, ip_address: &str) -> Result<i64> {
    let url = format!("{}/queueCount", ip_address.trim_end_matches('/'));
    let response = ctx.http.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(EngineError::Dispatch(format!("{} answered {}", url, response.status())));
    }
    let body: QueueCount = response.json().await?;
    Ok(body.count)
}

/// Resolve a pending SERVICE execution with the remote output
///
/// Returns `false` when the row is unknown or no longer STARTED.
pub async fn complete_service_execution(ctx: &EngineContext, task_instance_execution_id: i64, values: Vec<String>) -> Result<bool> {
    let Some(execution) = ctx.store.get_task_instance_execution(task_instance_execution_id).await? else {
        return Ok(false);
    };
    if execution.state != ExecutionState::Started {
        tracing::debug!(
            "⏭️ Completion for task instance execution {} ignored, state is {:?}",
            execution.id,
            execution.state
        );
        return Ok(false);
    }

    let task = ctx.executable_task(execution.task_instance_id).await?;
    let values = canonical_values(&ctx.types(), task.output_data_type_id, &values)?;

    let data_id = ctx.save_output(&task, &values).await?;
    let completed = ctx.store.complete_task_instance_execution(execution.id, Some(data_id)).await?;
    if completed {
        tracing::info!("✅ Service task instance execution {} completed", execution.id);
    }
    Ok(completed)
}

/// Poll the nodes of every dispatched SERVICE execution; returns the number resolved
pub async fn poll_started_services(ctx: &EngineContext) -> Result<usize> {
    let mut resolved = 0;
    for execution in ctx.store.task_instance_executions_in_state(ExecutionState::Started).await? {
        let execution_params = ctx.store.task_instance_execution_params(execution.id).await?;
        let (Some(ip_address), Some(remote_id)) = (
            execution_params.get(params::IP_ADDRESS),
            execution_params.get(params::REMOTE_EXECUTION_ID),
        ) else {
            continue;
        };

        match poll_service(ctx, &execution, ip_address, remote_id).await {
            Ok(true) => resolved += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("⚠️ Polling task instance execution {} failed: {}", execution.id, e);
            }
        }
    }
    Ok(resolved)
}

async fn poll_service(ctx: &EngineContext, execution: &TaskInstanceExecution, ip_address: &str, remote_id: &str) -> Result<bool> {
    let url = format!("{}/service/execution/{}", ip_address.trim_end_matches('/'), remote_id);
    let response = ctx.http.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(EngineError::Dispatch(format!("{} answered {}", url, response.status())));
    }
    let status: ServiceExecutionStatus = response.json().await?;

    match status.execution_state {
        state if state.is_finished() => {
            let values = status.output_data_values.ok_or_else(|| {
                EngineError::Decode(format!("{} reports {:?} without output values", url, state))
            })?;
            complete_service_execution(ctx, execution.id, values).await
        }
        state if state.is_aborted() => {
            tracing::error!(
                "❌ Remote execution {} of task instance execution {} ended {:?}",
                remote_id,
                execution.id,
                state
            );
            ctx.store.fail_task_instance_execution(execution.id).await
        }
        _ => Ok(false),
    }
}

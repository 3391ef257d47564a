/// Workflow starter
///
/// Promotes the oldest LOADED workflow execution to STARTED and seeds the DAG
/// walk with an already-ENDED execution of the start sentinel whose output is
/// the run's input.

use crate::error::Result;
use crate::runtime::context::EngineContext;
use crate::workflow::validation::validate_workflow;
use crate::workflow::ExecutionState;

/// Start at most one pending run; returns its id
pub async fn start_loaded_workflows(ctx: &EngineContext) -> Result<Option<i64>> {
    let Some(execution) = ctx.store.oldest_loaded_workflow_execution().await? else {
        return Ok(None);
    };

    let shape = match validate_workflow(&ctx.store, execution.workflow_id).await {
        Ok(shape) => shape,
        Err(e) => {
            tracing::error!(
                "❌ Workflow execution {} rejected, invalid workflow {}: {}",
                execution.id,
                execution.workflow_id,
                e
            );
            let failed = ctx
                .store
                .transition_workflow_execution(execution.id, ExecutionState::Loaded, ExecutionState::Failed)
                .await?;
            if failed {
                ctx.store.fail_parent_task_instance_execution(execution.id).await?;
            }
            return Ok(None);
        }
    };

    let started = ctx
        .store
        .start_workflow_execution(execution.id, shape.start_instance_id, execution.input_data_id)
        .await?;
    if !started {
        tracing::warn!("⚠️ Workflow execution {} left LOADED before it could start", execution.id);
        return Ok(None);
    }

    tracing::info!(
        "🚀 Started workflow execution {} (workflow {}, input {:?})",
        execution.id,
        execution.workflow_id,
        execution.input_data_id
    );
    Ok(Some(execution.id))
}

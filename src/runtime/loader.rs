/// Input loader
///
/// Assembles the input of every QUEUED task instance execution from the
/// latest execution of each upstream task instance in the same run. A
/// consumer waits while any producer is still running, or has not run yet but
/// still sits downstream of unfinished work in the run; once all are settled
/// their slices are merged into one persisted input and the row is LOADED.

use crate::datatype::index::{data_using_data_index, merge_partial_indexing};
use crate::datatype::Data;
use crate::error::{EngineError, Result};
use crate::runtime::context::EngineContext;
use crate::workflow::{ExecutionState, Sentinel, TaskInstanceExecution};
use std::collections::HashSet;

/// What happened to one queued row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    /// A producer is still running; retry next tick
    Deferred,
    /// Another actor moved the row first
    Skipped,
}

/// Load every QUEUED row whose producers have finished; returns the number loaded
pub async fn load_queued_task_instances(ctx: &EngineContext) -> Result<usize> {
    let mut loaded = 0;
    for execution in ctx.store.task_instance_executions_in_state(ExecutionState::Queued).await? {
        match load_task_instance_execution(ctx, &execution).await {
            Ok(LoadOutcome::Loaded) => loaded += 1,
            Ok(LoadOutcome::Deferred) => {
                tracing::debug!("⏳ Task instance execution {} waits for its producers", execution.id);
            }
            Ok(LoadOutcome::Skipped) => {
                tracing::debug!("⏭️ Task instance execution {} left QUEUED before loading", execution.id);
            }
            Err(e) => {
                tracing::error!("❌ Failed to load task instance execution {}: {}", execution.id, e);
                ctx.store.fail_task_instance_execution(execution.id).await?;
            }
        }
    }
    Ok(loaded)
}

/// Gather, merge and persist the input of one queued row
pub async fn load_task_instance_execution(ctx: &EngineContext, execution: &TaskInstanceExecution) -> Result<LoadOutcome> {
    let store = &ctx.store;
    let instance = store
        .get_task_instance(execution.task_instance_id)
        .await?
        .ok_or_else(|| EngineError::Consistency(format!("task instance {} does not exist", execution.task_instance_id)))?;
    let task = store.resolve_task(&instance).await?;

    let title = match task.sentinel {
        Some(Sentinel::Start) => {
            return Err(EngineError::Consistency(format!(
                "start sentinel {} was queued as a consumer",
                instance.id
            )))
        }
        Some(Sentinel::End) => {
            let workflow = store.require_workflow(instance.workflow_id).await?;
            format!("{} Result", workflow.title)
        }
        None => format!("{} Input", task.title),
    };

    let types = ctx.types();
    let mut slices = Vec::new();
    let mut not_run = Vec::new();
    for edge in store.incoming_edges(instance.workflow_id, instance.id).await? {
        let Some(producer) = store
            .latest_task_instance_execution(execution.workflow_execution_id, edge.source_instance_id)
            .await?
        else {
            not_run.push(edge.source_instance_id);
            continue;
        };

        if producer.state.is_aborted() {
            return Err(EngineError::Consistency(format!(
                "producer execution {} of task instance {} ended {:?}",
                producer.id, edge.source_instance_id, producer.state
            )));
        }
        if !producer.state.is_finished() {
            return Ok(LoadOutcome::Deferred);
        }
        if edge.is_decision() {
            continue;
        }

        let output = match producer.output_data_id {
            Some(id) => store.require_data(id).await?,
            None => Data::transient(0, Vec::new()),
        };
        let slice = data_using_data_index(&types, &output, &edge.source_index)?;
        slices.push((edge.target_index.clone(), slice));
    }

    // a producer without a row is an untaken branch once nothing upstream can still run
    if !not_run.is_empty()
        && has_unsettled_ancestor(ctx, instance.workflow_id, execution.workflow_execution_id, &not_run).await?
    {
        return Ok(LoadOutcome::Deferred);
    }

    let merged = merge_partial_indexing(&types, task.input_data_type_id, &slices)?;
    let data_id = store.save_data(task.input_data_type_id, &merged, &title).await?;
    if !store.load_task_instance_execution(execution.id, data_id).await? {
        return Ok(LoadOutcome::Skipped);
    }

    tracing::debug!(
        "📦 Loaded task instance execution {} with {} input values from {} edges",
        execution.id,
        merged.len(),
        slices.len()
    );
    Ok(LoadOutcome::Loaded)
}

/// Whether any ancestor of `instance_ids` has a row in the run that may still
/// queue successors (QUEUED, LOADED, STARTED or ENDED but not yet MARKED)
async fn has_unsettled_ancestor(
    ctx: &EngineContext,
    workflow_id: i64,
    workflow_execution_id: i64,
    instance_ids: &[i64],
) -> Result<bool> {
    let unsettled: HashSet<i64> = ctx
        .store
        .task_instance_executions_for_run(workflow_execution_id)
        .await?
        .into_iter()
        .filter(|row| {
            matches!(
                row.state,
                ExecutionState::Queued | ExecutionState::Loaded | ExecutionState::Started | ExecutionState::Ended
            )
        })
        .map(|row| row.task_instance_id)
        .collect();
    let edges = ctx.store.edges_for_workflow(workflow_id).await?;

    let mut seen: HashSet<i64> = instance_ids.iter().copied().collect();
    let mut stack: Vec<i64> = instance_ids.to_vec();
    while let Some(instance_id) = stack.pop() {
        for edge in edges.iter().filter(|edge| edge.target_instance_id == instance_id) {
            if unsettled.contains(&edge.source_instance_id) {
                return Ok(true);
            }
            if seen.insert(edge.source_instance_id) {
                stack.push(edge.source_instance_id);
            }
        }
    }
    Ok(false)
}

/// Next-step queuer
///
/// Walks every ENDED task instance execution once: follows its outgoing edges,
/// then marks it consumed and queues the successors it unlocks in one
/// transaction. A decision edge (source path `[0,0]`) fires only when the
/// source produced no data or the single value 0, and then it is the only
/// edge that fires for that source. Definitions with more than one decision
/// edge per source are rejected before a run starts.

use crate::datatype::Data;
use crate::error::Result;
use crate::runtime::context::EngineContext;
use crate::workflow::{Edge, ExecutionState, TaskInstanceExecution};
use std::collections::HashSet;

/// Mark ENDED executions and queue their successors; returns the number queued
pub async fn queue_next_task_instances(ctx: &EngineContext) -> Result<usize> {
    let store = &ctx.store;
    let mut queued = store.queued_pairs().await?;
    let mut count = 0;

    for execution in store.task_instance_executions_in_state(ExecutionState::Ended).await? {
        let pairs = match successors(ctx, &execution).await {
            Ok(pairs) => pairs,
            Err(e) => {
                tracing::error!(
                    "❌ Cannot follow edges of task instance execution {}, failing it: {}",
                    execution.id,
                    e
                );
                store
                    .transition_task_instance_execution(execution.id, ExecutionState::Ended, ExecutionState::Failed)
                    .await?;
                continue;
            }
        };

        let fresh: Vec<(i64, i64)> = pairs.into_iter().filter(|pair| !queued.contains(pair)).collect();
        let Some(ids) = store.mark_task_instance_execution(execution.id, &fresh).await? else {
            tracing::debug!("⏭️ Task instance execution {} changed state, skipping", execution.id);
            continue;
        };

        for ((task_instance_id, workflow_execution_id), id) in fresh.iter().zip(&ids) {
            tracing::debug!(
                "📥 Queued task instance {} in workflow execution {} as {}",
                task_instance_id,
                workflow_execution_id,
                id
            );
        }
        count += fresh.len();
        queued.extend(fresh);
    }
    Ok(count)
}

async fn successors(ctx: &EngineContext, execution: &TaskInstanceExecution) -> Result<Vec<(i64, i64)>> {
    let Some(instance) = ctx.store.get_task_instance(execution.task_instance_id).await? else {
        return Ok(Vec::new());
    };
    let edges = ctx.store.outgoing_edges(instance.workflow_id, instance.id).await?;
    let output = match execution.output_data_id {
        Some(id) => ctx.store.get_data(id).await?,
        None => None,
    };
    Ok(select_successors(&edges, output.as_ref(), execution.workflow_execution_id))
}

/// (task instance, workflow execution) pairs a finished source unlocks
pub fn select_successors(edges: &[Edge], output: Option<&Data>, workflow_execution_id: i64) -> Vec<(i64, i64)> {
    if let Some(decision) = edges.iter().find(|edge| edge.is_decision()) {
        if takes_decision_branch(output) {
            return vec![(decision.target_instance_id, workflow_execution_id)];
        }
    }

    let mut seen = HashSet::new();
    edges
        .iter()
        .filter(|edge| !edge.is_decision())
        .map(|edge| (edge.target_instance_id, workflow_execution_id))
        .filter(|pair| seen.insert(*pair))
        .collect()
}

/// No data at all, or exactly one leaf equal to zero
fn takes_decision_branch(output: Option<&Data>) -> bool {
    match output {
        None => true,
        Some(data) => {
            data.values.len() == 1 && data.values[0].trim().parse::<f64>().map(|v| v == 0.0).unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::DataIndex;

    fn edge(id: i64, source_index: DataIndex, target: i64) -> Edge {
        Edge {
            id,
            workflow_id: 1,
            source_instance_id: 10,
            source_index,
            target_instance_id: target,
            target_index: DataIndex::root(),
        }
    }

    fn output(values: &[&str]) -> Data {
        Data::transient(1, values.iter().map(|v| v.to_string()).collect())
    }

    #[test]
    fn test_decision_edge_preempts_ordinary_edges() {
        let edges = [edge(1, DataIndex::root(), 20), edge(2, DataIndex::decision(), 30)];

        assert_eq!(select_successors(&edges, Some(&output(&["0"])), 5), vec![(30, 5)]);
        assert_eq!(select_successors(&edges, Some(&output(&["1"])), 5), vec![(20, 5)]);
        assert_eq!(select_successors(&edges, None, 5), vec![(30, 5)]);
    }

    #[test]
    fn test_multi_value_output_never_takes_decision() {
        let edges = [edge(1, DataIndex::root(), 20), edge(2, DataIndex::decision(), 30)];
        assert_eq!(select_successors(&edges, Some(&output(&["0", "0"])), 5), vec![(20, 5)]);
        assert_eq!(select_successors(&edges, Some(&output(&["0.0"])), 5), vec![(30, 5)]);
    }

    #[test]
    fn test_fan_out_is_deduplicated_per_source() {
        let edges = [
            edge(1, DataIndex(vec![(1, 1)]), 20),
            edge(2, DataIndex(vec![(1, 2)]), 20),
            edge(3, DataIndex::root(), 21),
        ];
        assert_eq!(select_successors(&edges, Some(&output(&["4", "2"])), 5), vec![(20, 5), (21, 5)]);
    }
}

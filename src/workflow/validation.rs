/// Workflow definition validation using petgraph
///
/// Runs before a workflow execution starts. Builds the task instance graph
/// from the persisted edges and checks the invariants the scheduler relies on:
/// exactly two terminal instances, edges confined to the workflow, no edge
/// into the start sentinel, at most one decision edge per source and no
/// cycles.

use crate::error::{EngineError, Result};
use crate::workflow::storage::Store;
use crate::workflow::types::{Edge, TaskInstance};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Terminal instances of a validated workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowShape {
    pub start_instance_id: i64,
    pub end_instance_id: i64,
}

/// Check a workflow's instances (in insertion order) and edges
pub fn validate_definition(workflow_id: i64, instances: &[TaskInstance], edges: &[Edge]) -> Result<WorkflowShape> {
    tracing::debug!("🏗️ Building instance graph for workflow {}", workflow_id);

    let terminals: Vec<&TaskInstance> = instances.iter().filter(|i| i.is_terminal()).collect();
    if terminals.len() != 2 {
        return Err(EngineError::Consistency(format!(
            "workflow {} has {} terminal instances, expected 2",
            workflow_id,
            terminals.len()
        )));
    }
    let shape = WorkflowShape {
        start_instance_id: terminals[0].id,
        end_instance_id: terminals[1].id,
    };

    let mut graph: DiGraph<i64, i64> = DiGraph::new();
    let mut index_of: HashMap<i64, NodeIndex> = HashMap::new();
    for instance in instances {
        if instance.workflow_id != workflow_id {
            return Err(EngineError::Consistency(format!(
                "task instance {} belongs to workflow {}, not {}",
                instance.id, instance.workflow_id, workflow_id
            )));
        }
        index_of.insert(instance.id, graph.add_node(instance.id));
    }

    let mut decision_sources: HashSet<i64> = HashSet::new();
    for edge in edges {
        let from = index_of.get(&edge.source_instance_id).ok_or_else(|| {
            EngineError::Consistency(format!(
                "edge {} starts at task instance {} outside workflow {}",
                edge.id, edge.source_instance_id, workflow_id
            ))
        })?;
        let to = index_of.get(&edge.target_instance_id).ok_or_else(|| {
            EngineError::Consistency(format!(
                "edge {} ends at task instance {} outside workflow {}",
                edge.id, edge.target_instance_id, workflow_id
            ))
        })?;
        if edge.target_instance_id == shape.start_instance_id {
            return Err(EngineError::Consistency(format!(
                "edge {} leads into the start sentinel of workflow {}",
                edge.id, workflow_id
            )));
        }
        if edge.is_decision() && !decision_sources.insert(edge.source_instance_id) {
            return Err(EngineError::Consistency(format!(
                "task instance {} has more than one decision edge in workflow {}",
                edge.source_instance_id, workflow_id
            )));
        }
        graph.add_edge(*from, *to, edge.id);
    }

    if let Err(cycle) = toposort(&graph, None) {
        let instance_id = graph[cycle.node_id()];
        return Err(EngineError::Consistency(format!(
            "workflow {} contains a cycle through task instance {}",
            workflow_id, instance_id
        )));
    }

    tracing::debug!("✅ Workflow {} definition is a valid DAG", workflow_id);
    Ok(shape)
}

/// Load a workflow's definition from the store and validate it
pub async fn validate_workflow(store: &Store, workflow_id: i64) -> Result<WorkflowShape> {
    let instances = store.task_instances_for_workflow(workflow_id).await?;
    let edges = store.edges_for_workflow(workflow_id).await?;
    validate_definition(workflow_id, &instances, &edges)
}

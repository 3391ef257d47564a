//! Shared fixtures for flowd integration tests
//!
//! Seeds data types and workflow definitions into an in-memory store.

#![allow(dead_code)]

use flowd::config::HttpConfig;
use flowd::datatype::{BaseKind, DataType, TypeCatalog};
use flowd::runtime::{EngineContext, ExecutionEngine};
use flowd::workflow::{ExecutionState, TaskType, WorkflowExecution};
use flowd::DataIndex;
use std::sync::Arc;
use std::time::Duration;

pub const INT: i64 = 1;
pub const TEXT: i64 = 2;
/// Two records of `{a: INT, b: INT}`
pub const PAIRS: i64 = 3;
/// One record of `{left: INT, right: INT}`
pub const COUPLE: i64 = 4;

pub fn test_types() -> Vec<DataType> {
    vec![
        DataType::leaf(INT, "number", BaseKind::Int),
        DataType::leaf(TEXT, "text", BaseKind::Text),
        DataType::structure(PAIRS, "pairs", 2, &[("a", INT), ("b", INT)]),
        DataType::structure(COUPLE, "couple", 1, &[("left", INT), ("right", INT)]),
    ]
}

/// Engine context over a fresh in-memory store
pub async fn test_context() -> EngineContext {
    let store = flowd::Store::in_memory().await.expect("in-memory store");
    store.init_schema().await.expect("schema");
    let catalog = TypeCatalog::from_types(test_types()).expect("valid test types");
    EngineContext::new(store, Arc::new(catalog), "127.0.0.1:5000", &HttpConfig::default()).expect("engine context")
}

pub fn test_engine(ctx: &EngineContext) -> ExecutionEngine {
    ExecutionEngine::new(ctx.clone(), Duration::from_millis(10))
}

/// Instance ids of a `start -> task -> end` workflow
#[derive(Debug, Clone, Copy)]
pub struct Pipeline {
    pub workflow_id: i64,
    pub task_id: i64,
    pub start: i64,
    pub task: i64,
    pub end: i64,
}

/// `start -> task -> end` with whole-value edges
pub async fn single_task_workflow(
    ctx: &EngineContext,
    title: &str,
    task_type: TaskType,
    data_type_id: i64,
    params: &[(&str, &str)],
) -> Pipeline {
    let store = &ctx.store;
    let workflow_id = store
        .insert_workflow(title, data_type_id, data_type_id)
        .await
        .expect("workflow");
    let start = store.insert_task_instance(workflow_id, 0).await.expect("start");
    let task_id = store
        .insert_task(title, task_type, data_type_id, data_type_id, params)
        .await
        .expect("task");
    let task = store.insert_task_instance(workflow_id, task_id).await.expect("instance");
    let end = store.insert_task_instance(workflow_id, 0).await.expect("end");

    connect(ctx, workflow_id, start, task).await;
    connect(ctx, workflow_id, task, end).await;

    Pipeline {
        workflow_id,
        task_id,
        start,
        task,
        end,
    }
}

/// Whole-value edge
pub async fn connect(ctx: &EngineContext, workflow_id: i64, source: i64, target: i64) {
    ctx.store
        .insert_edge(workflow_id, source, &DataIndex::root(), target, &DataIndex::root())
        .await
        .expect("edge");
}

/// Store `values` and submit a LOADED run of `workflow_id`
pub async fn submit(ctx: &EngineContext, workflow_id: i64, data_type_id: i64, values: &[&str]) -> i64 {
    let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    let data_id = ctx
        .store
        .save_data(data_type_id, &values, "test input")
        .await
        .expect("input data");
    ctx.store
        .insert_workflow_execution(workflow_id, Some(data_id), &[])
        .await
        .expect("workflow execution")
}

/// Tick until the run leaves the success chain or ends; returns its final row
pub async fn run_to_completion(engine: &ExecutionEngine, workflow_execution_id: i64, max_ticks: usize) -> WorkflowExecution {
    let store = &engine.context().store;
    for _ in 0..max_ticks {
        engine.tick().await;
        let execution = store
            .get_workflow_execution(workflow_execution_id)
            .await
            .expect("lookup")
            .expect("run exists");
        if execution.state.is_finished() || execution.state.is_aborted() {
            return execution;
        }
    }
    store
        .get_workflow_execution(workflow_execution_id)
        .await
        .expect("lookup")
        .expect("run exists")
}

/// Output values of a finished run
pub async fn output_values(ctx: &EngineContext, execution: &WorkflowExecution) -> Vec<String> {
    assert_eq!(execution.state, ExecutionState::Ended, "run {} did not end", execution.id);
    let data_id = execution.output_data_id.expect("finished run has output");
    ctx.store.require_data(data_id).await.expect("output data").values
}

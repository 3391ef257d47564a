/// Workflow Management Layer
///
/// Definitions and execution rows, their SQLite persistence, and the
/// definition checks run before a workflow execution starts:
/// - Type definitions (Workflow, Task, TaskInstance, Edge, executions)
/// - SQLite persistence with sqlx
/// - DAG validation with petgraph

// Core workflow and execution type definitions
pub mod types;

// SQLite persistence layer shared with the administration side
pub mod storage;

// Definition checks (terminal sentinels, edge scope, acyclicity)
pub mod validation;

// Re-export commonly used types
pub use storage::Store;
pub use types::{
    params, Edge, ExecutionState, Node, Sentinel, Service, Task, TaskInstance, TaskInstanceExecution, TaskType, Workflow,
    WorkflowExecution,
};

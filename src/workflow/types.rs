/// Core workflow and execution type definitions
///
/// Definitions (workflows, tasks, task instances, edges, nodes, services) are
/// written by the administration layer and only read by the engine. Execution
/// rows (workflow executions and task instance executions) are the engine's
/// own state machine and are persisted with integer state codes.

use crate::datatype::DataIndex;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameter bag keys shared between the engine, remote nodes and the API
pub mod params {
    /// Task: whitespace separated program and arguments (SYSTEM)
    pub const COMMAND: &str = "command";
    /// Task: request URL (WEB)
    pub const URL: &str = "url";
    /// Task: HTTP method, GET when absent (WEB)
    pub const METHOD: &str = "method";
    /// Task: send the input object as JSON body (WEB)
    pub const SEND_BODY: &str = "sendBody";
    /// Task: embedded Lua source (SCRIPT)
    pub const CODE: &str = "code";
    /// Task: service id advertised by remote nodes (SERVICE)
    pub const UNIFORM_SERVICE_ID: &str = "uniformServiceId";
    /// Task: task the decision node dispatches as (DECISION)
    pub const SUB_TASK_ID: &str = "subTaskId";
    /// Task: nested workflow to run (WORKFLOW)
    pub const WORKFLOW_ID: &str = "workflowId";

    /// Task instance execution: base URL of the node running the service
    pub const IP_ADDRESS: &str = "ipAddress";
    /// Task instance execution: workflow execution id on the remote node
    pub const REMOTE_EXECUTION_ID: &str = "workflowExecutionId";

    /// Workflow execution: path to POST the output to on completion
    pub const CALL_BACK: &str = "callBack";
    /// Workflow execution: host:port of the caller that wants the callback
    pub const REMOTE_ADDR: &str = "remoteAddr";
    /// Workflow execution: parent task instance execution of a nested run
    pub const PARENT_EXECUTION_ID: &str = "taskInstanceExecutionId";
}

/// Execution state of a workflow execution or task instance execution
///
/// `Queued < Loaded < Started < Ended < Marked` is the success chain;
/// `Killed` and `Failed` are terminal and outside of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum ExecutionState {
    Queued,
    Loaded,
    Started,
    Ended,
    Marked,
    Killed,
    Failed,
}

impl ExecutionState {
    pub fn code(self) -> i64 {
        match self {
            ExecutionState::Queued => 0,
            ExecutionState::Loaded => 1,
            ExecutionState::Started => 2,
            ExecutionState::Ended => 3,
            ExecutionState::Marked => 4,
            ExecutionState::Killed => -1,
            ExecutionState::Failed => -2,
        }
    }

    /// Ended successfully, whether or not the scheduler has consumed it yet
    pub fn is_finished(self) -> bool {
        matches!(self, ExecutionState::Ended | ExecutionState::Marked)
    }

    /// Terminated without output
    pub fn is_aborted(self) -> bool {
        matches!(self, ExecutionState::Killed | ExecutionState::Failed)
    }
}

impl TryFrom<i64> for ExecutionState {
    type Error = EngineError;

    fn try_from(code: i64) -> Result<Self> {
        match code {
            0 => Ok(ExecutionState::Queued),
            1 => Ok(ExecutionState::Loaded),
            2 => Ok(ExecutionState::Started),
            3 => Ok(ExecutionState::Ended),
            4 => Ok(ExecutionState::Marked),
            -1 => Ok(ExecutionState::Killed),
            -2 => Ok(ExecutionState::Failed),
            other => Err(EngineError::Consistency(format!("unknown execution state {}", other))),
        }
    }
}

impl From<ExecutionState> for i64 {
    fn from(state: ExecutionState) -> i64 {
        state.code()
    }
}

/// Task kinds with their persisted codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum TaskType {
    /// Local child process fed through stdin/stdout
    System,
    /// Remote node dispatch with asynchronous completion
    Service,
    /// Nested workflow run
    Workflow,
    /// HTTP request with JSON bodies
    Web,
    Ui,
    /// Embedded Lua fragment
    Script,
    /// Indirection to the task named by `subTaskId`
    Decision,
    Map,
    Reduce,
    Filter,
    /// Start or end sentinel
    Terminal,
}

impl TaskType {
    pub fn code(self) -> i64 {
        match self {
            TaskType::System => 0,
            TaskType::Service => 1,
            TaskType::Workflow => 2,
            TaskType::Web => 3,
            TaskType::Ui => 4,
            TaskType::Script => 5,
            TaskType::Decision => 6,
            TaskType::Map => 7,
            TaskType::Reduce => 8,
            TaskType::Filter => 9,
            TaskType::Terminal => 10,
        }
    }
}

impl TryFrom<i64> for TaskType {
    type Error = EngineError;

    fn try_from(code: i64) -> Result<Self> {
        Ok(match code {
            0 => TaskType::System,
            1 => TaskType::Service,
            2 => TaskType::Workflow,
            3 => TaskType::Web,
            4 => TaskType::Ui,
            5 => TaskType::Script,
            6 => TaskType::Decision,
            7 => TaskType::Map,
            8 => TaskType::Reduce,
            9 => TaskType::Filter,
            10 => TaskType::Terminal,
            other => return Err(EngineError::Consistency(format!("unknown task type {}", other))),
        })
    }
}

impl From<TaskType> for i64 {
    fn from(task_type: TaskType) -> i64 {
        task_type.code()
    }
}

/// Workflow definition header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: i64,
    pub title: String,
    pub input_data_type_id: i64,
    pub output_data_type_id: i64,
}

/// Which end of the DAG a terminal instance bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentinel {
    Start,
    End,
}

/// Reusable node definition, or a sentinel fabricated from its workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub task_type: TaskType,
    pub input_data_type_id: i64,
    pub output_data_type_id: i64,
    pub params: BTreeMap<String, String>,
    /// Set only for the terminal instances of a workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentinel: Option<Sentinel>,
}

impl Task {
    /// Sentinel task for a workflow's start or end instance
    pub fn sentinel(workflow: &Workflow, sentinel: Sentinel) -> Self {
        let (title, input, output) = match sentinel {
            Sentinel::Start => ("start", 0, workflow.input_data_type_id),
            Sentinel::End => ("end", workflow.output_data_type_id, 0),
        };
        Self {
            id: 0,
            title: title.to_string(),
            task_type: TaskType::Terminal,
            input_data_type_id: input,
            output_data_type_id: output,
            params: BTreeMap::new(),
            sentinel: Some(sentinel),
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn require_param(&self, name: &str) -> Result<&str> {
        self.param(name).ok_or_else(|| {
            EngineError::Consistency(format!("task {} ({}) has no '{}' parameter", self.id, self.title, name))
        })
    }

    /// Integer parameter such as `subTaskId` or `workflowId`
    pub fn require_id_param(&self, name: &str) -> Result<i64> {
        let raw = self.require_param(name)?;
        raw.trim().parse().map_err(|_| {
            EngineError::Consistency(format!("task {} parameter '{}' is not an id: {}", self.id, name, raw))
        })
    }
}

/// Placement of a task inside one workflow; `task_id == 0` marks a terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    pub id: i64,
    pub workflow_id: i64,
    pub task_id: i64,
}

impl TaskInstance {
    pub fn is_terminal(&self) -> bool {
        self.task_id == 0
    }
}

/// Data route between two task instances of one workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: i64,
    pub workflow_id: i64,
    pub source_instance_id: i64,
    pub source_index: DataIndex,
    pub target_instance_id: i64,
    pub target_index: DataIndex,
}

impl Edge {
    /// Control-only edge taken when the source outputs the single value 0
    pub fn is_decision(&self) -> bool {
        self.source_index.is_decision()
    }
}

/// Remote node able to run services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: i64,
    pub title: String,
    /// Base URL, e.g. `http://10.0.0.7:5000`
    pub ip_address: String,
}

/// Workflow published by a node under a uniform service id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: i64,
    pub title: String,
    pub node_id: i64,
    pub workflow_id: i64,
    pub node_service_id: String,
    pub uniform_service_id: String,
}

/// One run of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: i64,
    pub workflow_id: i64,
    pub entry_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub input_data_id: Option<i64>,
    pub output_data_id: Option<i64>,
    pub state: ExecutionState,
    pub params: BTreeMap<String, String>,
}

impl WorkflowExecution {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// One run of a task instance inside a workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstanceExecution {
    pub id: i64,
    pub workflow_execution_id: i64,
    pub task_instance_id: i64,
    pub entry_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub input_data_id: Option<i64>,
    pub output_data_id: Option<i64>,
    pub state: ExecutionState,
}

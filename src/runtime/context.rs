/// Engine context shared by every phase of the driver loop
///
/// Replaces process-wide state with one explicit value: the store, the type
/// catalog, the outbound HTTP client and this engine's advertised address.

use crate::config::HttpConfig;
use crate::datatype::{Data, TypeCatalog, TypeSnapshot};
use crate::error::{EngineError, Result};
use crate::workflow::{params, Store, Task, TaskInstanceExecution, TaskType};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct EngineContext {
    pub store: Store,
    pub catalog: Arc<TypeCatalog>,
    pub http: reqwest::Client,
    /// `host:port` remote nodes deliver completion callbacks to
    pub advertise_addr: String,
}

impl EngineContext {
    pub fn new(store: Store, catalog: Arc<TypeCatalog>, advertise_addr: impl Into<String>, http: &HttpConfig) -> Result<Self> {
        Ok(Self {
            store,
            catalog,
            http: http_client(http)?,
            advertise_addr: advertise_addr.into(),
        })
    }

    pub fn types(&self) -> TypeSnapshot {
        self.catalog.snapshot()
    }

    /// Task an execution actually runs, following one DECISION indirection
    pub async fn executable_task(&self, task_instance_id: i64) -> Result<Task> {
        let instance = self
            .store
            .get_task_instance(task_instance_id)
            .await?
            .ok_or_else(|| EngineError::Consistency(format!("task instance {} does not exist", task_instance_id)))?;
        let task = self.store.resolve_task(&instance).await?;
        if task.task_type != TaskType::Decision {
            return Ok(task);
        }

        let sub_task_id = task.require_id_param(params::SUB_TASK_ID)?;
        let sub_task = self.store.require_task(sub_task_id).await?;
        if sub_task.task_type == TaskType::Decision {
            return Err(EngineError::Consistency(format!(
                "decision task {} resolves to another decision task {}",
                task.id, sub_task.id
            )));
        }
        tracing::debug!("🔀 Decision task {} dispatches as task {} ({})", task.id, sub_task.id, sub_task.title);
        Ok(sub_task)
    }

    /// Input data loaded for an execution
    pub async fn input_of(&self, execution: &TaskInstanceExecution) -> Result<Data> {
        let data_id = execution.input_data_id.ok_or_else(|| {
            EngineError::Consistency(format!("task instance execution {} has no input", execution.id))
        })?;
        self.store.require_data(data_id).await
    }

    /// Persist a task's output as `<title> Result` of its output type
    pub async fn save_output(&self, task: &Task, values: &[String]) -> Result<i64> {
        self.store
            .save_data(task.output_data_type_id, values, &format!("{} Result", task.title))
            .await
    }
}

/// Outbound client; an expired timeout surfaces as a dispatch error
pub fn http_client(config: &HttpConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.request_timeout())
        .connect_timeout(config.connect_timeout())
        .build()
        .map_err(|e| EngineError::Dispatch(format!("failed to build HTTP client: {}", e)))
}

/// Task executor dispatcher
///
/// Advances LOADED task instance executions to STARTED and hands each one to
/// the strategy for its task type. SYSTEM, WEB and SCRIPT complete within the
/// tick; SERVICE and WORKFLOW stay STARTED until their continuation resolves;
/// the end sentinel completes the whole workflow execution.

use crate::datatype::codec::{data_to_object, data_to_text, object_to_data, text_to_data};
use crate::datatype::Data;
use crate::error::{EngineError, Result};
use crate::runtime::context::EngineContext;
use crate::runtime::script::run_script;
use crate::runtime::service::{dispatch_service, poll_started_services, CompletionRequest};
use crate::workflow::{params, ExecutionState, Sentinel, Task, TaskInstanceExecution, TaskType};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

/// Per-tick counts of the dispatcher phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Rows moved from LOADED to STARTED and dispatched
    pub dispatched: usize,
    /// Rows that ended in FAILED during dispatch
    pub failed: usize,
    /// Pending SERVICE rows resolved by polling
    pub polled: usize,
}

/// Dispatches loaded task instance executions by task type
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    ctx: EngineContext,
}

impl TaskExecutor {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Run every LOADED row, then poll dispatched services
    pub async fn execute_loaded_task_instances(&self) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        let store = &self.ctx.store;

        for execution in store.task_instance_executions_in_state(ExecutionState::Loaded).await? {
            let started = store
                .transition_task_instance_execution(execution.id, ExecutionState::Loaded, ExecutionState::Started)
                .await?;
            if !started {
                tracing::debug!("⏭️ Task instance execution {} left LOADED, skipping", execution.id);
                continue;
            }
            report.dispatched += 1;

            match self.execute(&execution).await {
                Ok(()) => {}
                Err(e) if e.is_script() => {
                    tracing::error!(
                        "❌ Script failed in task instance execution {}, failing workflow execution {}: {}",
                        execution.id,
                        execution.workflow_execution_id,
                        e
                    );
                    store.fail_workflow_execution(execution.workflow_execution_id).await?;
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::error!("❌ Task instance execution {} failed: {}", execution.id, e);
                    store.fail_task_instance_execution(execution.id).await?;
                    report.failed += 1;
                }
            }
        }

        report.polled = poll_started_services(&self.ctx).await?;
        Ok(report)
    }

    /// Dispatch one STARTED row by its (decision-resolved) task type
    async fn execute(&self, execution: &TaskInstanceExecution) -> Result<()> {
        let task = self.ctx.executable_task(execution.task_instance_id).await?;
        let input = self.ctx.input_of(execution).await?;
        tracing::debug!(
            "⚙️ Executing task instance execution {} as {:?} task '{}'",
            execution.id,
            task.task_type,
            task.title
        );

        match task.task_type {
            TaskType::System => {
                let values = self.execute_system(&task, &input).await?;
                self.finish(&task, execution, &values).await
            }
            TaskType::Web => {
                let values = self.execute_web(&task, &input).await?;
                self.finish(&task, execution, &values).await
            }
            TaskType::Script => {
                let values = self.execute_script(&task, &input).await?;
                self.finish(&task, execution, &values).await
            }
            TaskType::Service => dispatch_service(&self.ctx, &task, execution, &input).await,
            TaskType::Workflow => self.start_nested_workflow(&task, execution, &input).await,
            TaskType::Terminal => match task.sentinel {
                Some(Sentinel::Start) => Err(EngineError::Consistency(format!(
                    "start sentinel reached as consumer in task instance execution {}",
                    execution.id
                ))),
                _ => self.end_workflow_execution(execution, &input).await,
            },
            other => Err(EngineError::Dispatch(format!("task type {:?} is not supported", other))),
        }
    }

    /// Persist output and move STARTED -> ENDED
    async fn finish(&self, task: &Task, execution: &TaskInstanceExecution, values: &[String]) -> Result<()> {
        let data_id = self.ctx.save_output(task, values).await?;
        if self
            .ctx
            .store
            .complete_task_instance_execution(execution.id, Some(data_id))
            .await?
        {
            tracing::info!("✅ Task '{}' finished in task instance execution {}", task.title, execution.id);
        } else {
            tracing::warn!("⚠️ Task instance execution {} changed state while running", execution.id);
        }
        Ok(())
    }

    /// Feed the text encoding to a child process and decode its stdout
    async fn execute_system(&self, task: &Task, input: &Data) -> Result<Vec<String>> {
        let command = task.require_param(params::COMMAND)?;
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| EngineError::Consistency(format!("task {} has an empty command", task.id)))?;
        let types = self.ctx.types();
        let text = data_to_text(&types, input)?;

        tracing::debug!("🖥️ Spawning '{}'", command);
        let mut child = tokio::process::Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Dispatch("child process has no stdin".to_string()))?;

        let write = async move {
            let result = stdin.write_all(text.as_bytes()).await;
            drop(stdin);
            result
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output?;
        if let Err(e) = written {
            // a process may exit without reading its input
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e.into());
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!("❌ '{}' exited with {}: {}", command, output.status, stderr.trim());
            return Err(EngineError::Dispatch(format!("'{}' exited with {}", command, output.status)));
        }
        let stdout = String::from_utf8(output.stdout)
            .map_err(|e| EngineError::Decode(format!("process output is not UTF-8: {}", e)))?;
        text_to_data(&types, &stdout, task.output_data_type_id)
    }

    /// HTTP request with the object encoding as optional JSON body
    async fn execute_web(&self, task: &Task, input: &Data) -> Result<Vec<String>> {
        let url = task.require_param(params::URL)?;
        let method_name = task.param(params::METHOD).unwrap_or("GET").to_uppercase();
        let method = reqwest::Method::from_bytes(method_name.as_bytes())
            .map_err(|_| EngineError::Dispatch(format!("unsupported HTTP method: {}", method_name)))?;
        let send_body = task
            .param(params::SEND_BODY)
            .map(|flag| matches!(flag.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);
        let types = self.ctx.types();

        tracing::debug!("🌍 HTTP Request: {} {}", method, url);
        let mut request = self.ctx.http.request(method.clone(), url);
        if send_body {
            let body = data_to_object(&types, input)?;
            tracing::debug!("📦 Request body: {}", body);
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Dispatch(format!("{} {} answered {}", method, url, status)));
        }
        let object: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Decode(format!("response of {} is not JSON: {}", url, e)))?;

        tracing::info!("✅ HTTP request completed: {} {} (status: {})", method, url, status);
        object_to_data(&types, &object, task.output_data_type_id)
    }

    /// Run the task's Lua code off the async workers
    async fn execute_script(&self, task: &Task, input: &Data) -> Result<Vec<String>> {
        let code = task.require_param(params::CODE)?.to_string();
        let types = self.ctx.types();
        let input = input.clone();
        let output_data_type_id = task.output_data_type_id;

        tokio::task::spawn_blocking(move || run_script(&types, &code, &input, output_data_type_id))
            .await
            .map_err(|e| EngineError::Script(format!("script task aborted: {}", e)))?
    }

    /// Submit a nested run linked back to this row, which stays STARTED
    async fn start_nested_workflow(&self, task: &Task, execution: &TaskInstanceExecution, input: &Data) -> Result<()> {
        let workflow_id = task.require_id_param(params::WORKFLOW_ID)?;
        self.ctx.store.require_workflow(workflow_id).await?;

        let nested_id = self
            .ctx
            .store
            .insert_workflow_execution(
                workflow_id,
                Some(input.id),
                &[(params::PARENT_EXECUTION_ID, execution.id.to_string())],
            )
            .await?;
        tracing::info!(
            "🪆 Task instance execution {} started nested workflow execution {} (workflow {})",
            execution.id,
            nested_id,
            workflow_id
        );
        Ok(())
    }

    /// End sentinel: record the run's output, then notify caller and parent
    async fn end_workflow_execution(&self, execution: &TaskInstanceExecution, output: &Data) -> Result<()> {
        let store = &self.ctx.store;
        let run = store
            .get_workflow_execution(execution.workflow_execution_id)
            .await?
            .ok_or_else(|| {
                EngineError::Consistency(format!(
                    "workflow execution {} does not exist",
                    execution.workflow_execution_id
                ))
            })?;

        if !store.finish_workflow_execution(run.id, output.id).await? {
            return Err(EngineError::Consistency(format!(
                "workflow execution {} was not STARTED when its end sentinel ran",
                run.id
            )));
        }
        store.complete_task_instance_execution(execution.id, Some(output.id)).await?;
        tracing::info!("🏁 Workflow execution {} ended with {:?}", run.id, output.values);

        if let (Some(call_back), Some(remote_addr)) = (run.param(params::CALL_BACK), run.param(params::REMOTE_ADDR)) {
            let url = format!("http://{}{}", remote_addr, call_back);
            let body = CompletionRequest {
                values: output.values.clone(),
            };
            match self.ctx.http.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::info!("📨 Delivered result of workflow execution {} to {}", run.id, url);
                }
                Ok(response) => {
                    tracing::warn!("⚠️ Callback {} answered {}", url, response.status());
                }
                Err(e) => {
                    tracing::warn!("⚠️ Callback {} failed: {}", url, e);
                }
            }
        }

        if let Some(parent) = run.param(params::PARENT_EXECUTION_ID) {
            let parent_id: i64 = parent.parse().map_err(|_| {
                EngineError::Consistency(format!("workflow execution {} has malformed parent link '{}'", run.id, parent))
            })?;
            if store.complete_task_instance_execution(parent_id, Some(output.id)).await? {
                tracing::info!("🔗 Parent task instance execution {} resolved by nested run {}", parent_id, run.id);
            } else {
                tracing::warn!("⚠️ Parent task instance execution {} was no longer STARTED", parent_id);
            }
        }
        Ok(())
    }
}

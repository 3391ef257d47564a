/// SQLite persistence layer for definitions, data and execution state
///
/// The store is the single source of truth shared with the administration
/// layer and with remote callbacks. Every state transition is a
/// compare-and-set on the current state, so a row moved by another actor
/// between read and write is skipped rather than clobbered.

use crate::datatype::{Data, DataIndex};
use crate::error::{EngineError, Result};
use crate::workflow::types::{
    params, Edge, ExecutionState, Node, Sentinel, Service, Task, TaskInstance, TaskInstanceExecution, TaskType, Workflow,
    WorkflowExecution,
};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workflows (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        input_data_type_id INTEGER NOT NULL,
        output_data_type_id INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        ip_address TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS services (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        node_id INTEGER NOT NULL,
        workflow_id INTEGER NOT NULL,
        node_service_id TEXT NOT NULL,
        uniform_service_id TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        task_type INTEGER NOT NULL,
        input_data_type_id INTEGER NOT NULL,
        output_data_type_id INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_params (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_instances (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_id INTEGER NOT NULL,
        task_id INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS edges (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_id INTEGER NOT NULL,
        source_instance_id INTEGER NOT NULL,
        source_index TEXT NOT NULL,
        target_instance_id INTEGER NOT NULL,
        target_index TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS data (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        data_type_id INTEGER NOT NULL,
        created TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS unit_data (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        data_id INTEGER NOT NULL,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_id INTEGER NOT NULL,
        entry_time TEXT NOT NULL,
        start_time TEXT,
        end_time TEXT,
        input_data_id INTEGER,
        output_data_id INTEGER,
        execution_state INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_execution_params (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_execution_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_instance_executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_execution_id INTEGER NOT NULL,
        task_instance_id INTEGER NOT NULL,
        entry_time TEXT NOT NULL,
        start_time TEXT,
        end_time TEXT,
        input_data_id INTEGER,
        output_data_id INTEGER,
        execution_state INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_instance_execution_params (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_instance_execution_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        value TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_unit_data_data ON unit_data(data_id)",
    "CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(workflow_id, source_instance_id)",
    "CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(workflow_id, target_instance_id)",
    "CREATE INDEX IF NOT EXISTS idx_tie_state ON task_instance_executions(execution_state)",
    "CREATE INDEX IF NOT EXISTS idx_tie_run ON task_instance_executions(workflow_execution_id, task_instance_id)",
    "CREATE INDEX IF NOT EXISTS idx_we_state ON workflow_executions(execution_state)",
];

/// A remote node offering a uniform service, with the node-local service id
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceEndpoint {
    pub node: Node,
    pub node_service_id: String,
}

/// SQLite-backed store shared by every engine phase and the HTTP layer
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) a database file
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("🗄️ Opening datastore: {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self::new(pool))
    }

    /// Ephemeral single-connection database
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create every table; safe to call multiple times (uses IF NOT EXISTS)
    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("📋 Datastore schema ready");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Definitions
    // ---------------------------------------------------------------------

    pub async fn insert_workflow(&self, title: &str, input_data_type_id: i64, output_data_type_id: i64) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO workflows (title, input_data_type_id, output_data_type_id) VALUES (?, ?, ?)",
        )
        .bind(title)
        .bind(input_data_type_id)
        .bind(output_data_type_id)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_workflow(&self, id: i64) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT id, title, input_data_type_id, output_data_type_id FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Workflow {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                input_data_type_id: row.try_get("input_data_type_id")?,
                output_data_type_id: row.try_get("output_data_type_id")?,
            })),
            None => Ok(None),
        }
    }

    pub async fn require_workflow(&self, id: i64) -> Result<Workflow> {
        self.get_workflow(id)
            .await?
            .ok_or_else(|| EngineError::Consistency(format!("workflow {} does not exist", id)))
    }

    /// Insert a task together with its parameters
    pub async fn insert_task(
        &self,
        title: &str,
        task_type: TaskType,
        input_data_type_id: i64,
        output_data_type_id: i64,
        params: &[(&str, &str)],
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "INSERT INTO tasks (title, task_type, input_data_type_id, output_data_type_id) VALUES (?, ?, ?, ?)",
        )
        .bind(title)
        .bind(task_type.code())
        .bind(input_data_type_id)
        .bind(output_data_type_id)
        .execute(&mut *tx)
        .await?;
        let task_id = result.last_insert_rowid();

        for (name, value) in params {
            sqlx::query("INSERT INTO task_params (task_id, title, value) VALUES (?, ?, ?)")
                .bind(task_id)
                .bind(*name)
                .bind(*value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(task_id)
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let row = sqlx::query(
            "SELECT id, title, task_type, input_data_type_id, output_data_type_id FROM tasks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let param_rows = sqlx::query("SELECT title, value FROM task_params WHERE task_id = ? ORDER BY id ASC")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        let mut params = BTreeMap::new();
        for param in param_rows {
            params.insert(param.try_get("title")?, param.try_get("value")?);
        }

        Ok(Some(Task {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            task_type: TaskType::try_from(row.try_get::<i64, _>("task_type")?)?,
            input_data_type_id: row.try_get("input_data_type_id")?,
            output_data_type_id: row.try_get("output_data_type_id")?,
            params,
            sentinel: None,
        }))
    }

    pub async fn require_task(&self, id: i64) -> Result<Task> {
        self.get_task(id)
            .await?
            .ok_or_else(|| EngineError::Consistency(format!("task {} does not exist", id)))
    }

    pub async fn insert_task_instance(&self, workflow_id: i64, task_id: i64) -> Result<i64> {
        let result = sqlx::query("INSERT INTO task_instances (workflow_id, task_id) VALUES (?, ?)")
            .bind(workflow_id)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_task_instance(&self, id: i64) -> Result<Option<TaskInstance>> {
        let row = sqlx::query("SELECT id, workflow_id, task_id FROM task_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| task_instance_from_row(&row)).transpose()
    }

    /// Instances of a workflow in insertion order
    pub async fn task_instances_for_workflow(&self, workflow_id: i64) -> Result<Vec<TaskInstance>> {
        let rows = sqlx::query("SELECT id, workflow_id, task_id FROM task_instances WHERE workflow_id = ? ORDER BY id ASC")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_instance_from_row).collect()
    }

    /// Terminal instances of a workflow; the earliest is the start sentinel
    pub async fn terminal_instances(&self, workflow_id: i64) -> Result<Vec<TaskInstance>> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, task_id FROM task_instances WHERE workflow_id = ? AND task_id = 0 ORDER BY id ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_instance_from_row).collect()
    }

    /// Task a task instance runs, fabricating sentinels for terminal instances
    pub async fn resolve_task(&self, instance: &TaskInstance) -> Result<Task> {
        if !instance.is_terminal() {
            return self.require_task(instance.task_id).await;
        }

        let workflow = self.require_workflow(instance.workflow_id).await?;
        let terminals = self.terminal_instances(instance.workflow_id).await?;
        if terminals.len() != 2 {
            return Err(EngineError::Consistency(format!(
                "workflow {} has {} terminal instances, expected 2",
                workflow.id,
                terminals.len()
            )));
        }
        let sentinel = if terminals[0].id == instance.id {
            Sentinel::Start
        } else {
            Sentinel::End
        };
        Ok(Task::sentinel(&workflow, sentinel))
    }

    pub async fn insert_edge(
        &self,
        workflow_id: i64,
        source_instance_id: i64,
        source_index: &DataIndex,
        target_instance_id: i64,
        target_index: &DataIndex,
    ) -> Result<i64> {
        let source = encode_index(source_index)?;
        let target = encode_index(target_index)?;
        let result = sqlx::query(
            r#"
            INSERT INTO edges (workflow_id, source_instance_id, source_index, target_instance_id, target_index)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(workflow_id)
        .bind(source_instance_id)
        .bind(source)
        .bind(target_instance_id)
        .bind(target)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn edges_for_workflow(&self, workflow_id: i64) -> Result<Vec<Edge>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, source_instance_id, source_index, target_instance_id, target_index
            FROM edges WHERE workflow_id = ? ORDER BY id ASC
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(edge_from_row).collect()
    }

    pub async fn outgoing_edges(&self, workflow_id: i64, source_instance_id: i64) -> Result<Vec<Edge>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, source_instance_id, source_index, target_instance_id, target_index
            FROM edges WHERE workflow_id = ? AND source_instance_id = ? ORDER BY id ASC
            "#,
        )
        .bind(workflow_id)
        .bind(source_instance_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(edge_from_row).collect()
    }

    pub async fn incoming_edges(&self, workflow_id: i64, target_instance_id: i64) -> Result<Vec<Edge>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, source_instance_id, source_index, target_instance_id, target_index
            FROM edges WHERE workflow_id = ? AND target_instance_id = ? ORDER BY id ASC
            "#,
        )
        .bind(workflow_id)
        .bind(target_instance_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(edge_from_row).collect()
    }

    pub async fn insert_node(&self, title: &str, ip_address: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO nodes (title, ip_address) VALUES (?, ?)")
            .bind(title)
            .bind(ip_address)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn insert_service(
        &self,
        title: &str,
        node_id: i64,
        workflow_id: i64,
        node_service_id: &str,
        uniform_service_id: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO services (title, node_id, workflow_id, node_service_id, uniform_service_id)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(title)
        .bind(node_id)
        .bind(workflow_id)
        .bind(node_service_id)
        .bind(uniform_service_id)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_service(&self, id: i64) -> Result<Option<Service>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, node_id, workflow_id, node_service_id, uniform_service_id
            FROM services WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Service {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                node_id: row.try_get("node_id")?,
                workflow_id: row.try_get("workflow_id")?,
                node_service_id: row.try_get("node_service_id")?,
                uniform_service_id: row.try_get("uniform_service_id")?,
            })),
            None => Ok(None),
        }
    }

    /// Nodes advertising a uniform service, in node id order
    pub async fn service_endpoints(&self, uniform_service_id: &str) -> Result<Vec<ServiceEndpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT nodes.id, nodes.title, nodes.ip_address, services.node_service_id
            FROM services JOIN nodes ON nodes.id = services.node_id
            WHERE services.uniform_service_id = ?
            ORDER BY nodes.id ASC, services.id ASC
            "#,
        )
        .bind(uniform_service_id)
        .fetch_all(&self.pool)
        .await?;

        let mut endpoints = Vec::with_capacity(rows.len());
        for row in rows {
            endpoints.push(ServiceEndpoint {
                node: Node {
                    id: row.try_get("id")?,
                    title: row.try_get("title")?,
                    ip_address: row.try_get("ip_address")?,
                },
                node_service_id: row.try_get("node_service_id")?,
            });
        }
        Ok(endpoints)
    }

    // ---------------------------------------------------------------------
    // Data
    // ---------------------------------------------------------------------

    /// Persist a data value and its leaves in one transaction
    pub async fn save_data(&self, data_type_id: i64, values: &[String], title: &str) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("INSERT INTO data (title, data_type_id, created) VALUES (?, ?, ?)")
            .bind(title)
            .bind(data_type_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        let data_id = result.last_insert_rowid();

        for value in values {
            sqlx::query("INSERT INTO unit_data (data_id, value) VALUES (?, ?)")
                .bind(data_id)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        tracing::debug!("💾 Saved data {} '{}' ({} values)", data_id, title, values.len());
        Ok(data_id)
    }

    pub async fn get_data(&self, id: i64) -> Result<Option<Data>> {
        let row = sqlx::query("SELECT id, title, data_type_id, created FROM data WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let values: Vec<String> = sqlx::query("SELECT value FROM unit_data WHERE data_id = ? ORDER BY id ASC")
            .bind(id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|unit| unit.try_get("value"))
            .collect::<std::result::Result<_, _>>()?;

        Ok(Some(Data {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            data_type_id: row.try_get("data_type_id")?,
            created: row.try_get("created")?,
            values,
        }))
    }

    pub async fn require_data(&self, id: i64) -> Result<Data> {
        self.get_data(id)
            .await?
            .ok_or_else(|| EngineError::Consistency(format!("data {} does not exist", id)))
    }

    // ---------------------------------------------------------------------
    // Workflow executions
    // ---------------------------------------------------------------------

    /// Submit a run in state LOADED together with its parameter bag
    pub async fn insert_workflow_execution(
        &self,
        workflow_id: i64,
        input_data_id: Option<i64>,
        params: &[(&str, String)],
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_executions (workflow_id, entry_time, input_data_id, execution_state)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(workflow_id)
        .bind(Utc::now())
        .bind(input_data_id)
        .bind(ExecutionState::Loaded.code())
        .execute(&mut *tx)
        .await?;
        let execution_id = result.last_insert_rowid();

        for (name, value) in params {
            sqlx::query("INSERT INTO workflow_execution_params (workflow_execution_id, title, value) VALUES (?, ?, ?)")
                .bind(execution_id)
                .bind(*name)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(execution_id)
    }

    pub async fn get_workflow_execution(&self, id: i64) -> Result<Option<WorkflowExecution>> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_id, entry_time, start_time, end_time, input_data_id, output_data_id, execution_state
            FROM workflow_executions WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let params = self.workflow_execution_params(id).await?;
                Ok(Some(workflow_execution_from_row(&row, params)?))
            }
            None => Ok(None),
        }
    }

    pub async fn workflow_execution_params(&self, id: i64) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query(
            "SELECT title, value FROM workflow_execution_params WHERE workflow_execution_id = ? ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        params_from_rows(&rows)
    }

    /// Oldest run waiting to be started
    pub async fn oldest_loaded_workflow_execution(&self) -> Result<Option<WorkflowExecution>> {
        let row = sqlx::query("SELECT id FROM workflow_executions WHERE execution_state = ? ORDER BY id ASC LIMIT 1")
            .bind(ExecutionState::Loaded.code())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => self.get_workflow_execution(row.try_get("id")?).await,
            None => Ok(None),
        }
    }

    /// LOADED -> STARTED plus the already-ENDED start sentinel execution
    /// carrying the run's input, in one transaction.
    ///
    /// Returns `false` when another actor moved the run first.
    pub async fn start_workflow_execution(&self, id: i64, start_instance_id: i64, input_data_id: Option<i64>) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE workflow_executions SET execution_state = ?, start_time = ? WHERE id = ? AND execution_state = ?",
        )
        .bind(ExecutionState::Started.code())
        .bind(now)
        .bind(id)
        .bind(ExecutionState::Loaded.code())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO task_instance_executions
                (workflow_execution_id, task_instance_id, entry_time, start_time, end_time, output_data_id, execution_state)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(start_instance_id)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(input_data_id)
        .bind(ExecutionState::Ended.code())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Compare-and-set on a run's state; stamps start/end times
    pub async fn transition_workflow_execution(&self, id: i64, from: ExecutionState, to: ExecutionState) -> Result<bool> {
        let sql = format!(
            "UPDATE workflow_executions SET execution_state = ?{} WHERE id = ? AND execution_state = ?",
            stamp_column(to)
        );
        let mut query = sqlx::query(&sql).bind(to.code());
        if !stamp_column(to).is_empty() {
            query = query.bind(Utc::now());
        }
        let result = query.bind(id).bind(from.code()).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// STARTED -> ENDED with the run's output
    pub async fn finish_workflow_execution(&self, id: i64, output_data_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions SET execution_state = ?, output_data_id = ?, end_time = ?
            WHERE id = ? AND execution_state = ?
            "#,
        )
        .bind(ExecutionState::Ended.code())
        .bind(output_data_id)
        .bind(Utc::now())
        .bind(id)
        .bind(ExecutionState::Started.code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Fail a run and every task instance execution belonging to it
    ///
    /// Returns `false` when the run had already ended or been aborted.
    pub async fn fail_workflow_execution(&self, id: i64) -> Result<bool> {
        self.abort_workflow_execution(id, ExecutionState::Failed).await
    }

    /// Explicit cancellation of an unfinished run and all of its task
    /// instance executions
    pub async fn kill_workflow_execution(&self, id: i64) -> Result<bool> {
        self.abort_workflow_execution(id, ExecutionState::Killed).await
    }

    async fn abort_workflow_execution(&self, id: i64, state: ExecutionState) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions SET execution_state = ?, end_time = ?
            WHERE id = ? AND execution_state NOT IN (?, ?, ?, ?)
            "#,
        )
        .bind(state.code())
        .bind(now)
        .bind(id)
        .bind(ExecutionState::Killed.code())
        .bind(ExecutionState::Failed.code())
        .bind(ExecutionState::Ended.code())
        .bind(ExecutionState::Marked.code())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE task_instance_executions SET execution_state = ?, end_time = COALESCE(end_time, ?)
            WHERE workflow_execution_id = ? AND execution_state NOT IN (?, ?)
            "#,
        )
        .bind(state.code())
        .bind(now)
        .bind(id)
        .bind(ExecutionState::Killed.code())
        .bind(ExecutionState::Failed.code())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.fail_parent_task_instance_execution(id).await?;
        Ok(true)
    }

    /// Fail the WORKFLOW row a nested run was started for, if it still waits
    ///
    /// Returns the parent row id when one was failed.
    pub async fn fail_parent_task_instance_execution(&self, workflow_execution_id: i64) -> Result<Option<i64>> {
        let run_params = self.workflow_execution_params(workflow_execution_id).await?;
        let Some(parent) = run_params.get(params::PARENT_EXECUTION_ID) else {
            return Ok(None);
        };
        let parent_id: i64 = parent.parse().map_err(|_| {
            EngineError::Consistency(format!(
                "workflow execution {} has malformed parent link '{}'",
                workflow_execution_id, parent
            ))
        })?;

        if self.fail_task_instance_execution(parent_id).await? {
            tracing::warn!(
                "⚠️ Parent task instance execution {} failed with nested run {}",
                parent_id,
                workflow_execution_id
            );
            Ok(Some(parent_id))
        } else {
            Ok(None)
        }
    }

    /// Runs between QUEUED and STARTED (this engine's own queue length)
    pub async fn count_active_workflow_executions(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(id) AS count FROM workflow_executions WHERE execution_state BETWEEN ? AND ?")
            .bind(ExecutionState::Queued.code())
            .bind(ExecutionState::Started.code())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    // ---------------------------------------------------------------------
    // Task instance executions
    // ---------------------------------------------------------------------

    pub async fn insert_queued_task_instance_execution(&self, workflow_execution_id: i64, task_instance_id: i64) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_instance_executions (workflow_execution_id, task_instance_id, entry_time, execution_state)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(workflow_execution_id)
        .bind(task_instance_id)
        .bind(Utc::now())
        .bind(ExecutionState::Queued.code())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_task_instance_execution(&self, id: i64) -> Result<Option<TaskInstanceExecution>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_TIE))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| task_instance_execution_from_row(&row)).transpose()
    }

    /// Every task instance execution in one state, oldest first
    pub async fn task_instance_executions_in_state(&self, state: ExecutionState) -> Result<Vec<TaskInstanceExecution>> {
        let rows = sqlx::query(&format!("{} WHERE execution_state = ? ORDER BY id ASC", SELECT_TIE))
            .bind(state.code())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_instance_execution_from_row).collect()
    }

    pub async fn task_instance_executions_for_run(&self, workflow_execution_id: i64) -> Result<Vec<TaskInstanceExecution>> {
        let rows = sqlx::query(&format!("{} WHERE workflow_execution_id = ? ORDER BY id ASC", SELECT_TIE))
            .bind(workflow_execution_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_instance_execution_from_row).collect()
    }

    /// Most recent execution of a task instance within one run
    pub async fn latest_task_instance_execution(
        &self,
        workflow_execution_id: i64,
        task_instance_id: i64,
    ) -> Result<Option<TaskInstanceExecution>> {
        let rows = sqlx::query(&format!(
            "{} WHERE workflow_execution_id = ? AND task_instance_id = ? ORDER BY id DESC LIMIT 1",
            SELECT_TIE
        ))
        .bind(workflow_execution_id)
        .bind(task_instance_id)
        .fetch_optional(&self.pool)
        .await?;
        rows.map(|row| task_instance_execution_from_row(&row)).transpose()
    }

    /// (task instance, workflow execution) pairs currently QUEUED
    pub async fn queued_pairs(&self) -> Result<HashSet<(i64, i64)>> {
        let rows = sqlx::query(
            "SELECT task_instance_id, workflow_execution_id FROM task_instance_executions WHERE execution_state = ?",
        )
        .bind(ExecutionState::Queued.code())
        .fetch_all(&self.pool)
        .await?;

        let mut pairs = HashSet::with_capacity(rows.len());
        for row in rows {
            pairs.insert((row.try_get("task_instance_id")?, row.try_get("workflow_execution_id")?));
        }
        Ok(pairs)
    }

    /// Compare-and-set on a task instance execution's state; stamps start/end times
    pub async fn transition_task_instance_execution(&self, id: i64, from: ExecutionState, to: ExecutionState) -> Result<bool> {
        let sql = format!(
            "UPDATE task_instance_executions SET execution_state = ?{} WHERE id = ? AND execution_state = ?",
            stamp_column(to)
        );
        let mut query = sqlx::query(&sql).bind(to.code());
        if !stamp_column(to).is_empty() {
            query = query.bind(Utc::now());
        }
        let result = query.bind(id).bind(from.code()).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// ENDED -> MARKED together with the QUEUED rows of the successors it
    /// unlocks, in one transaction
    ///
    /// Returns `None` when another actor moved the row first, otherwise the
    /// ids of the queued rows in `successors` order.
    pub async fn mark_task_instance_execution(&self, id: i64, successors: &[(i64, i64)]) -> Result<Option<Vec<i64>>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("UPDATE task_instance_executions SET execution_state = ? WHERE id = ? AND execution_state = ?")
            .bind(ExecutionState::Marked.code())
            .bind(id)
            .bind(ExecutionState::Ended.code())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let mut queued = Vec::with_capacity(successors.len());
        for &(task_instance_id, workflow_execution_id) in successors {
            let result = sqlx::query(
                r#"
                INSERT INTO task_instance_executions (workflow_execution_id, task_instance_id, entry_time, execution_state)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(workflow_execution_id)
            .bind(task_instance_id)
            .bind(now)
            .bind(ExecutionState::Queued.code())
            .execute(&mut *tx)
            .await?;
            queued.push(result.last_insert_rowid());
        }
        tx.commit().await?;
        Ok(Some(queued))
    }

    /// QUEUED -> LOADED with the merged input
    pub async fn load_task_instance_execution(&self, id: i64, input_data_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE task_instance_executions SET execution_state = ?, input_data_id = ? WHERE id = ? AND execution_state = ?",
        )
        .bind(ExecutionState::Loaded.code())
        .bind(input_data_id)
        .bind(id)
        .bind(ExecutionState::Queued.code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// STARTED -> ENDED with the produced output
    pub async fn complete_task_instance_execution(&self, id: i64, output_data_id: Option<i64>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_instance_executions SET execution_state = ?, output_data_id = ?, end_time = ?
            WHERE id = ? AND execution_state = ?
            "#,
        )
        .bind(ExecutionState::Ended.code())
        .bind(output_data_id)
        .bind(Utc::now())
        .bind(id)
        .bind(ExecutionState::Started.code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Converge a non-terminal task instance execution to FAILED
    pub async fn fail_task_instance_execution(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_instance_executions SET execution_state = ?, end_time = ?
            WHERE id = ? AND execution_state IN (?, ?, ?)
            "#,
        )
        .bind(ExecutionState::Failed.code())
        .bind(Utc::now())
        .bind(id)
        .bind(ExecutionState::Queued.code())
        .bind(ExecutionState::Loaded.code())
        .bind(ExecutionState::Started.code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_task_instance_execution_params(&self, id: i64, params: &[(&str, String)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (name, value) in params {
            sqlx::query(
                "INSERT INTO task_instance_execution_params (task_instance_execution_id, title, value) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(*name)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn task_instance_execution_params(&self, id: i64) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query(
            "SELECT title, value FROM task_instance_execution_params WHERE task_instance_execution_id = ? ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        params_from_rows(&rows)
    }
}

const SELECT_TIE: &str = r#"
    SELECT id, workflow_execution_id, task_instance_id, entry_time, start_time, end_time,
           input_data_id, output_data_id, execution_state
    FROM task_instance_executions"#;

/// Timestamp column a transition into `to` sets, as an UPDATE fragment
fn stamp_column(to: ExecutionState) -> &'static str {
    match to {
        ExecutionState::Started => ", start_time = ?",
        ExecutionState::Ended | ExecutionState::Failed | ExecutionState::Killed => ", end_time = ?",
        _ => "",
    }
}

fn encode_index(index: &DataIndex) -> Result<String> {
    serde_json::to_string(index).map_err(|e| EngineError::Consistency(format!("unencodable data index: {}", e)))
}

fn decode_index(raw: &str) -> Result<DataIndex> {
    serde_json::from_str(raw).map_err(|e| EngineError::Consistency(format!("malformed data index '{}': {}", raw, e)))
}

fn task_instance_from_row(row: &SqliteRow) -> Result<TaskInstance> {
    Ok(TaskInstance {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        task_id: row.try_get("task_id")?,
    })
}

fn edge_from_row(row: &SqliteRow) -> Result<Edge> {
    let source: String = row.try_get("source_index")?;
    let target: String = row.try_get("target_index")?;
    Ok(Edge {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        source_instance_id: row.try_get("source_instance_id")?,
        source_index: decode_index(&source)?,
        target_instance_id: row.try_get("target_instance_id")?,
        target_index: decode_index(&target)?,
    })
}

fn params_from_rows(rows: &[SqliteRow]) -> Result<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    for row in rows {
        params.insert(row.try_get("title")?, row.try_get("value")?);
    }
    Ok(params)
}

fn workflow_execution_from_row(row: &SqliteRow, params: BTreeMap<String, String>) -> Result<WorkflowExecution> {
    Ok(WorkflowExecution {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        entry_time: row.try_get::<DateTime<Utc>, _>("entry_time")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        input_data_id: row.try_get("input_data_id")?,
        output_data_id: row.try_get("output_data_id")?,
        state: ExecutionState::try_from(row.try_get::<i64, _>("execution_state")?)?,
        params,
    })
}

fn task_instance_execution_from_row(row: &SqliteRow) -> Result<TaskInstanceExecution> {
    Ok(TaskInstanceExecution {
        id: row.try_get("id")?,
        workflow_execution_id: row.try_get("workflow_execution_id")?,
        task_instance_id: row.try_get("task_instance_id")?,
        entry_time: row.try_get::<DateTime<Utc>, _>("entry_time")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        input_data_id: row.try_get("input_data_id")?,
        output_data_id: row.try_get("output_data_id")?,
        state: ExecutionState::try_from(row.try_get::<i64, _>("execution_state")?)?,
    })
}

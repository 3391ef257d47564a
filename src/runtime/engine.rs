/// Cooperative execution driver
///
/// One tick runs every phase in a fixed order: start a pending run, queue
/// successors of finished executions, load queued inputs, dispatch loaded
/// tasks (and poll dispatched services). Phases only communicate through the
/// store, so a tick interrupted at any point is picked up by the next one.

use crate::runtime::context::EngineContext;
use crate::runtime::executor::TaskExecutor;
use crate::runtime::loader::load_queued_task_instances;
use crate::runtime::scheduler::queue_next_task_instances;
use crate::runtime::starter::start_loaded_workflows;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// What one tick achieved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub started: Option<i64>,
    pub queued: usize,
    pub loaded: usize,
    pub dispatched: usize,
    pub failed: usize,
    pub resolved: usize,
}

impl TickReport {
    /// Whether any phase changed persisted state
    pub fn is_idle(&self) -> bool {
        self.started.is_none()
            && self.queued == 0
            && self.loaded == 0
            && self.dispatched == 0
            && self.failed == 0
            && self.resolved == 0
    }
}

/// Periodic driver over the engine phases
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    ctx: EngineContext,
    executor: TaskExecutor,
    interval: Duration,
}

impl ExecutionEngine {
    pub fn new(ctx: EngineContext, interval: Duration) -> Self {
        let executor = TaskExecutor::new(ctx.clone());
        Self { ctx, executor, interval }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Run all phases once; a failing phase is logged and the next one still runs
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        match start_loaded_workflows(&self.ctx).await {
            Ok(started) => report.started = started,
            Err(e) => tracing::error!("❌ Workflow starter failed: {}", e),
        }
        match queue_next_task_instances(&self.ctx).await {
            Ok(queued) => report.queued = queued,
            Err(e) => tracing::error!("❌ Next-step queuer failed: {}", e),
        }
        match load_queued_task_instances(&self.ctx).await {
            Ok(loaded) => report.loaded = loaded,
            Err(e) => tracing::error!("❌ Input loader failed: {}", e),
        }
        match self.executor.execute_loaded_task_instances().await {
            Ok(dispatch) => {
                report.dispatched = dispatch.dispatched;
                report.failed = dispatch.failed;
                report.resolved = dispatch.polled;
            }
            Err(e) => tracing::error!("❌ Task dispatcher failed: {}", e),
        }

        if !report.is_idle() {
            tracing::debug!("🔄 Tick: {:?}", report);
        }
        report
    }

    /// Tick until `shutdown` flips to true or its sender goes away
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("🚀 Execution engine running every {:?}", self.interval);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let tick_start = Instant::now();
            self.tick().await;
            let pause = self.interval.saturating_sub(tick_start.elapsed());

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("🛑 Execution engine stopped");
    }
}

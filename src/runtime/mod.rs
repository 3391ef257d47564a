/// Runtime Execution Engine
///
/// The store-driven state machine that moves workflow executions and their
/// task instance executions through QUEUED, LOADED, STARTED, ENDED and MARKED.
/// Each phase lives in its own module and is driven by [`ExecutionEngine`].

// Shared store, catalog and HTTP client
pub mod context;

// Periodic driver over all phases
pub mod engine;

// Per-task-type dispatch
pub mod executor;

// Input assembly for queued executions
pub mod loader;

// Successor queuing after a task ends
pub mod scheduler;

// Embedded Lua for SCRIPT tasks
pub mod script;

// Remote SERVICE dispatch, completion and polling
pub mod service;

// LOADED -> STARTED for workflow executions
pub mod starter;

// Re-export main types
pub use context::EngineContext;
pub use engine::{ExecutionEngine, TickReport};
pub use executor::TaskExecutor;

/// flowd: workflow orchestration daemon
///
/// A store-driven engine that runs DAG workflows of typed tasks (local
/// processes, HTTP calls, embedded Lua, remote services and nested workflows)
/// through a persisted execution state machine.

// Core configuration and setup
pub mod config;

// Engine error taxonomy
pub mod error;

// Data types, codecs and index paths
pub mod datatype;

// Workflow definitions, execution rows and the SQLite store
pub mod workflow;

// Runtime execution engine - the phases of the driver loop
pub mod runtime;

// HTTP API layer - execution protocol endpoints
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use datatype::{Data, DataIndex, DataType, TypeCatalog};
pub use error::{EngineError, Result};
pub use runtime::{EngineContext, ExecutionEngine};
pub use server::start_server;
pub use workflow::{ExecutionState, Store, TaskType};

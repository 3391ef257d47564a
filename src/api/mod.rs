/// HTTP API Layer
///
/// Endpoints of the engine's execution protocol. Nothing here touches
/// definitions; handlers only insert runs, resolve continuations and report
/// state, leaving the actual work to the driver loop.
/// - Completion callbacks and run submission
/// - Service node surface (queue depth, start, status, kill)

// Completion callbacks and workflow submission
pub mod callbacks;

// Service node endpoints consumed by other engines
pub mod service;

use crate::error::EngineError;
use crate::runtime::EngineContext;
use axum::{http::StatusCode, Router};

/// Shared state of every handler
#[derive(Debug, Clone)]
pub struct AppState {
    pub ctx: EngineContext,
}

impl AppState {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }
}

/// All engine routes, ready for `with_state`
pub fn create_engine_routes() -> Router<AppState> {
    Router::new()
        .merge(callbacks::create_callback_routes())
        .merge(service::create_service_routes())
}

/// Log an engine failure and map it to a status code
pub(crate) fn internal_error(context: &str, err: EngineError) -> StatusCode {
    tracing::error!("❌ {}: {}", context, err);
    match err {
        EngineError::Decode(_) => StatusCode::BAD_REQUEST,
        EngineError::Consistency(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// flowd: workflow orchestration daemon
///
/// Main entry point. Loads configuration from the environment and runs the
/// driver loop together with the HTTP surface until Ctrl-C.

use flowd::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Completion callbacks at /taskInstanceExecution/{id}/end
/// - Service node endpoints at /queueCount and /service/*
/// - Run submission at /workflow/{id}/execute
/// - Health check at /healthz
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to 0.0.0.0:5000 and ./datastore.db
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use jarvis_domain::config::Config;
use jarvis_mcp::McpManager;
use jarvis_orchestrator::Orchestrator;
use jarvis_tasks::TaskLifecycleManager;

/// Shared application state handed to every CLI command.
///
/// Wires the three-layer pipeline to a tool hub and a task store, then
/// hands the result to whichever CLI command asked for it. There is no
/// HTTP or chat-frontend adapter here — `cli::run` exercises
/// `Orchestrator::process` directly.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub config_path: PathBuf,
    pub orchestrator: Arc<Orchestrator>,
    pub mcp: Arc<McpManager>,
    pub tasks: Arc<TaskLifecycleManager>,
}

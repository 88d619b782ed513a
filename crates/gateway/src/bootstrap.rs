//! Wires the three-layer pipeline, the tool hub, and the task store into
//! an [`AppState`]. Shared by every CLI command so there is exactly one
//! boot path.

use std::sync::Arc;

use anyhow::Context;

use jarvis_domain::config::{Config, ConfigSeverity};
use jarvis_mcp::McpManager;
use jarvis_orchestrator::cim_policy::CimPolicyEngine;
use jarvis_orchestrator::Orchestrator;
use jarvis_providers::LlmRouter;
use jarvis_tasks::TaskLifecycleManager;

use crate::state::AppState;

/// Placeholder system-prompt prefix. Persona authoring lives with the
/// chat frontend, which is an external collaborator here.
const DEFAULT_PERSONA: &str = "You are a helpful assistant with access to tools.";

/// Validate config and initialize every subsystem. This is the shared
/// "boot" path used by every CLI command.
pub async fn build_app_state(config: Arc<Config>, config_path: String) -> anyhow::Result<AppState> {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── LLM providers + capability router ───────────────────────────
    let router = Arc::new(
        LlmRouter::from_config(&config.llm).context("initializing LLM providers")?,
    );
    if router.registry().is_empty() {
        tracing::warn!(
            "no LLM providers initialized — thinking/control/output calls will fail until \
             llm.providers is configured"
        );
    } else {
        tracing::info!(providers = router.registry().len(), "LLM provider registry ready");
    }

    // ── MCP tool hub ─────────────────────────────────────────────────
    let mcp = if config.mcp.effective_servers().is_empty() {
        tracing::info!("no MCP servers configured");
        Arc::new(McpManager::empty())
    } else {
        tracing::info!(
            count = config.mcp.effective_servers().len(),
            "initializing MCP servers"
        );
        Arc::new(McpManager::from_config(&config.mcp).await)
    };
    if mcp.tool_count() > 0 {
        tracing::info!(
            servers = mcp.server_count(),
            tools = mcp.tool_count(),
            "MCP tools discovered"
        );
    }

    // ── CIM policy engine ────────────────────────────────────────────
    let cim = Arc::new(CimPolicyEngine::load(&config.cim).context("loading CIM policy table")?);

    // ── Task lifecycle (SQLite) ──────────────────────────────────────
    let task_config = config.tasks.clamped();
    let tasks = Arc::new(
        TaskLifecycleManager::new(task_config.db_path.clone())
            .context("initializing task lifecycle store")?,
    );
    tracing::info!(db_path = %task_config.db_path, "task lifecycle store ready");

    // ── Orchestrator ─────────────────────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(
        router,
        mcp.clone(),
        cim,
        &config.orchestrator,
        DEFAULT_PERSONA,
        tasks.clone(),
    ));

    Ok(AppState {
        config,
        config_path: config_path.into(),
        orchestrator,
        mcp,
        tasks,
    })
}

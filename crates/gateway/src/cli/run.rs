//! `jarvis run` — one-shot execution command.
//!
//! Sends a single message through the orchestrator and prints the
//! response. The entry point for scripting and quick CLI interactions;
//! there is no chat-frontend or inbound-HTTP adapter here.

use std::io::Write;

use jarvis_orchestrator::{OrchestratorEvent, RuleInjection, TurnInput};

use crate::bootstrap;

/// Execute a single turn and print the response.
pub async fn run(
    message: String,
    session_key: String,
    model: Option<String>,
    json_output: bool,
) -> anyhow::Result<()> {
    let _ = model; // model override lives on individual role configs, not per-turn yet.

    let (config, config_path) = super::load_config()?;
    let state = bootstrap::build_app_state(std::sync::Arc::new(config), config_path).await?;

    let input = TurnInput {
        conversation_id: session_key,
        user_text: message,
        history: Vec::new(),
        available_skills: Vec::new(),
        rule_injection: RuleInjection::Full,
    };

    let (_turn_id, cancel, mut rx) = state.orchestrator.clone().run(input);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, cancelling turn");
            cancel.cancel();
        }
    });

    let mut exit_code = 0i32;
    let mut collected: Vec<OrchestratorEvent> = Vec::new();

    while let Some(event) = rx.recv().await {
        if json_output {
            collected.push(event);
            continue;
        }
        match &event {
            OrchestratorEvent::PlanReady { intent, .. } => {
                eprintln!("\x1b[2m[plan: {intent}]\x1b[0m");
            }
            OrchestratorEvent::ToolCall { tool_name, .. } => {
                eprintln!("\x1b[2m[tool: {tool_name}]\x1b[0m");
            }
            OrchestratorEvent::Blocked { reason } => {
                eprintln!("blocked: {reason}");
            }
            OrchestratorEvent::Final { content } | OrchestratorEvent::Stopped { content } => {
                println!("{content}");
                std::io::stdout().flush().ok();
            }
            OrchestratorEvent::Error { message } => {
                eprintln!("error: {message}");
                exit_code = 1;
            }
            _ => {}
        }
    }

    if json_output {
        let json = serde_json::to_string_pretty(&collected)
            .map_err(|e| anyhow::anyhow!("serializing events: {e}"))?;
        println!("{json}");
    }

    if exit_code != 0 {
        std::process::exit(exit_code);
    }

    Ok(())
}

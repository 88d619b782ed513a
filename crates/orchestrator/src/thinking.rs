//! Thinking layer: turns raw user text into a structured [`Plan`].
//!
//! Sends one streaming-capable model call in JSON mode, bounded at ~800
//! predicted tokens. The model is told which tool *names* exist, never their
//! arguments — argument filling is Control's job (see [`crate::control`]).

use std::sync::Arc;

use serde_json::{json, Value};

use jarvis_domain::error::Result;
use jarvis_domain::plan::Plan;
use jarvis_domain::tool::Message;
use jarvis_domain::trace::TraceEvent;
use jarvis_mcp::McpManager;
use jarvis_providers::{ChatRequest, LlmRouter};

use crate::json_parser::{safe_parse_json, STRATEGY_DEFAULT};

/// How much of the tool-detection rule set is folded into the system
/// prompt. Exists for small-context models that choke on the full rule text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleInjection {
    /// No tool-detection guidance at all; rely on the model's own judgment.
    Off,
    /// Only the safety-critical subset: memory save/search, container
    /// lifecycle.
    Thin,
    /// The full rule set, one line per policy category.
    Full,
}

const THIN_CATEGORIES: &[&str] = &["memory_write", "container_ops"];

const FULL_CATEGORIES: &[&str] = &[
    "destructive_fs",
    "skill_creation",
    "container_ops",
    "memory_write",
    "skill_execution",
    "archive_search",
    "web_search",
    "system_maintenance",
];

pub struct ThinkingLayer {
    router: Arc<LlmRouter>,
    mcp: Arc<McpManager>,
}

impl ThinkingLayer {
    pub fn new(router: Arc<LlmRouter>, mcp: Arc<McpManager>) -> Self {
        Self { router, mcp }
    }

    /// Produce a plan for one turn. Never fails the turn outright: a model
    /// error or unparseable response both degrade to a conservative default
    /// plan rather than aborting.
    pub async fn think(
        &self,
        turn_id: &str,
        user_text: &str,
        memory_preview: Option<&str>,
        rules: RuleInjection,
    ) -> Result<(Plan, &'static str)> {
        TraceEvent::ThinkingStarted {
            turn_id: turn_id.to_string(),
            model: "thinking".to_string(),
        }
        .emit();

        let tool_names = self.compact_tool_names().await;
        let system_prompt = build_system_prompt(&tool_names, memory_preview, rules);

        let req = ChatRequest {
            messages: vec![Message::system(system_prompt), Message::user(user_text)],
            tools: vec![],
            temperature: Some(0.2),
            max_tokens: Some(800),
            json_mode: true,
            model: None,
        };

        let (plan, strategy) = match self.router.chat_for_role("thinking", req).await {
            Ok(resp) => {
                let (mut value, strategy) =
                    safe_parse_json(&resp.content, default_plan_value(user_text), "thinking");
                ensure_intent(&mut value, user_text);
                let mut plan: Plan = serde_json::from_value(value).unwrap_or_else(|e| {
                    tracing::warn!(turn_id, error = %e, "parsed JSON did not fit Plan shape, using default");
                    conservative_default_plan(user_text)
                });
                normalize_time_reference(&mut plan, turn_id);
                (plan, strategy)
            }
            Err(e) => {
                tracing::warn!(turn_id, error = %e, "thinking model call failed, using conservative default plan");
                (conservative_default_plan(user_text), STRATEGY_DEFAULT)
            }
        };

        TraceEvent::PlanParsed {
            turn_id: turn_id.to_string(),
            parse_strategy: strategy.to_string(),
            hallucination_risk: format!("{:?}", plan.hallucination_risk).to_lowercase(),
        }
        .emit();

        Ok((plan, strategy))
    }

    async fn compact_tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .mcp
            .list_tools()
            .await
            .into_iter()
            .map(|(_, def)| def.name)
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

fn build_system_prompt(tool_names: &[String], memory_preview: Option<&str>, rules: RuleInjection) -> String {
    let mut prompt = String::from(
        "You are the planning stage of a reasoning assistant. Read the user's message and \
         emit a single JSON object describing what they want and how the system should respond. \
         Emit only tool *names* you believe are relevant — never their arguments.\n\n",
    );

    if tool_names.is_empty() {
        prompt.push_str("No tools are currently available.\n");
    } else {
        prompt.push_str("Available tool names: ");
        prompt.push_str(&tool_names.join(", "));
        prompt.push('\n');
    }

    match rules {
        RuleInjection::Off => {}
        RuleInjection::Thin => {
            prompt.push_str("\nSafety-critical categories to watch for: ");
            prompt.push_str(&THIN_CATEGORIES.join(", "));
            prompt.push('\n');
        }
        RuleInjection::Full => {
            prompt.push_str("\nIntent categories: ");
            prompt.push_str(&FULL_CATEGORIES.join(", "));
            prompt.push('\n');
        }
    }

    if let Some(preview) = memory_preview {
        prompt.push_str("\nRelevant memory excerpt:\n");
        prompt.push_str(preview);
        prompt.push('\n');
    }

    prompt.push_str(
        "\nRespond with JSON only: {\"intent\", \"needs_memory\", \"memory_keys\", \
         \"is_fact_query\", \"is_new_fact\", \"new_fact_key\", \"new_fact_value\", \
         \"hallucination_risk\", \"suggested_tools\", \"needs_sequential_thinking\", \
         \"sequential_complexity\", \"suggested_response_style\", \"reasoning_type\", \
         \"needs_chat_history\", \"suggested_cim_modes\", \"reasoning\", \"time_reference\"}. \
         \"time_reference\" is null unless the message refers to a specific day, in which case \
         it is one of \"today\", \"yesterday\", \"day_before_yesterday\", or an ISO date \
         (\"YYYY-MM-DD\").",
    );

    prompt
}

fn default_plan_value(user_text: &str) -> Value {
    json!({
        "intent": user_text,
        "hallucination_risk": "medium",
    })
}

/// The model omits `intent` on some malformed responses even though the
/// rest of the plan parses; `Plan::intent` has no serde default, so make
/// sure it's always present before deserializing.
fn ensure_intent(value: &mut Value, user_text: &str) {
    if let Value::Object(map) = value {
        map.entry("intent").or_insert_with(|| Value::String(user_text.to_string()));
    }
}

fn conservative_default_plan(user_text: &str) -> Plan {
    Plan {
        intent: user_text.to_string(),
        ..Default::default()
    }
}

const TIME_REFERENCE_KEYWORDS: &[&str] = &["today", "yesterday", "day_before_yesterday"];

/// Drop a `time_reference` the model invented in a shape nothing downstream
/// understands: one of the fixed keywords, or a `YYYY-MM-DD` date.
fn normalize_time_reference(plan: &mut Plan, turn_id: &str) {
    let Some(raw) = plan.time_reference.take() else {
        return;
    };
    let trimmed = raw.trim();
    if TIME_REFERENCE_KEYWORDS.contains(&trimmed) {
        plan.time_reference = Some(trimmed.to_string());
        return;
    }
    if chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").is_ok() {
        plan.time_reference = Some(trimmed.to_string());
        return;
    }
    if !trimmed.is_empty() {
        tracing::debug!(turn_id, raw = %raw, "dropping unrecognized time_reference shape");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_intent_fills_missing_key() {
        let mut v = json!({"needs_memory": true});
        ensure_intent(&mut v, "hello");
        assert_eq!(v["intent"], "hello");
    }

    #[test]
    fn ensure_intent_keeps_existing_value() {
        let mut v = json!({"intent": "already set"});
        ensure_intent(&mut v, "hello");
        assert_eq!(v["intent"], "already set");
    }

    #[test]
    fn build_system_prompt_off_omits_categories() {
        let prompt = build_system_prompt(&["exec".into()], None, RuleInjection::Off);
        assert!(!prompt.contains("Intent categories"));
        assert!(!prompt.contains("Safety-critical"));
    }

    #[test]
    fn build_system_prompt_full_lists_all_categories() {
        let prompt = build_system_prompt(&[], None, RuleInjection::Full);
        assert!(prompt.contains("destructive_fs"));
        assert!(prompt.contains("web_search"));
    }

    #[test]
    fn conservative_default_plan_carries_user_text_as_intent() {
        let plan = conservative_default_plan("list my files");
        assert_eq!(plan.intent, "list my files");
        assert!(!plan.needs_memory);
    }

    #[test]
    fn normalize_time_reference_keeps_known_keyword() {
        let mut plan = Plan {
            time_reference: Some("yesterday".into()),
            ..Default::default()
        };
        normalize_time_reference(&mut plan, "t1");
        assert_eq!(plan.time_reference.as_deref(), Some("yesterday"));
    }

    #[test]
    fn normalize_time_reference_keeps_iso_date() {
        let mut plan = Plan {
            time_reference: Some("2026-07-29".into()),
            ..Default::default()
        };
        normalize_time_reference(&mut plan, "t1");
        assert_eq!(plan.time_reference.as_deref(), Some("2026-07-29"));
    }

    #[test]
    fn normalize_time_reference_drops_garbage() {
        let mut plan = Plan {
            time_reference: Some("sometime last spring".into()),
            ..Default::default()
        };
        normalize_time_reference(&mut plan, "t1");
        assert_eq!(plan.time_reference, None);
    }
}

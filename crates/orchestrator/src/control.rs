//! Control layer: verifies and normalizes a [`Plan`] into a [`VerifiedPlan`].
//!
//! Three responsibilities, run in order: quick deterministic safety checks,
//! the CIM policy engine, and an optional second-model verification pass.
//! Tool-name normalization (cleaning, dedup, Hub-availability fail-closed,
//! trivial argument autofill) happens alongside.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};
use uuid::Uuid;

use jarvis_domain::cim::ActionType;
use jarvis_domain::plan::{HallucinationRisk, Plan, VerifiedPlan};
use jarvis_domain::tool::{Message, ToolCall};
use jarvis_domain::trace::TraceEvent;
use jarvis_mcp::McpManager;
use jarvis_providers::{ChatRequest, LlmRouter};

use crate::cim_policy::CimPolicyEngine;
use crate::json_parser::safe_parse_json;

/// Tool names Control treats as always-available, bypassing the Hub
/// availability check. Kept deliberately tiny: anything requiring real
/// side effects must go through the Hub so refresh/reload stays the single
/// source of truth for what exists.
const NATIVE_TOOL_ALLOWLIST: &[&str] = &["think", "respond"];

pub struct ControlLayer {
    router: Arc<LlmRouter>,
    mcp: Arc<McpManager>,
    cim: Arc<CimPolicyEngine>,
    control_timeout_ms: u64,
}

impl ControlLayer {
    pub fn new(
        router: Arc<LlmRouter>,
        mcp: Arc<McpManager>,
        cim: Arc<CimPolicyEngine>,
        control_timeout_ms: u64,
    ) -> Self {
        Self {
            router,
            mcp,
            cim,
            control_timeout_ms,
        }
    }

    /// Verify a raw plan and normalize its tool calls. Returns the
    /// `VerifiedPlan` plus the concrete `ToolCall`s the orchestrator should
    /// dispatch (tool-argument autofill lives here, not on `Plan` itself).
    pub async fn verify(
        &self,
        turn_id: &str,
        user_text: &str,
        mut plan: Plan,
        parse_strategy: &str,
        memory_excerpt: Option<&str>,
        available_skills: &[String],
    ) -> (VerifiedPlan, Vec<ToolCall>) {
        let mut warnings = Vec::new();
        let forced_confirmation = self.quick_safety_checks(user_text, &mut plan, &mut warnings);

        let cim_decision = self.cim.process(user_text, available_skills);
        TraceEvent::CimDecisionMade {
            pattern_id: cim_decision.policy_match.as_ref().map(|m| m.pattern_id.clone()),
            action: format!("{:?}", cim_decision.action),
            matched: cim_decision.matched,
        }
        .emit();

        let tool_calls = self.normalize_tool_calls(&plan.suggested_tools, user_text).await;

        let (final_plan, verify_warning) = self.llm_verify(user_text, plan, memory_excerpt).await;
        if let Some(w) = verify_warning {
            warnings.push(w);
        }

        let needs_skill_confirmation = cim_decision.requires_confirmation
            || cim_decision.action == ActionType::RequestUserConfirmation
            || forced_confirmation;

        TraceEvent::ControlDecision {
            turn_id: turn_id.to_string(),
            action: format!("{:?}", cim_decision.action),
            requires_confirmation: needs_skill_confirmation,
            time_reference: final_plan.time_reference.clone(),
        }
        .emit();

        let final_instruction = final_plan.intent.clone();

        let verified = VerifiedPlan {
            plan: final_plan,
            parse_strategy: parse_strategy.to_string(),
            final_instruction,
            warnings,
            cim_decision: Some(cim_decision),
            needs_skill_confirmation,
        };

        (verified, tool_calls)
    }

    // ── 1. Quick safety checks ──────────────────────────────────────

    /// Returns `true` when a safety condition forces `needs_skill_confirmation`
    /// on the eventual `VerifiedPlan` — the turn must be blocked until a human
    /// confirms, rather than let the model answer unchecked.
    fn quick_safety_checks(&self, user_text: &str, plan: &mut Plan, warnings: &mut Vec<String>) -> bool {
        if email_re().is_match(user_text) || phone_re().is_match(user_text) {
            warnings.push("user text appears to contain PII (email or phone pattern)".to_string());
        }
        if credential_re().is_match(user_text) {
            warnings.push("user text appears to reference credentials".to_string());
        }

        if plan.needs_memory && plan.memory_keys.is_empty() {
            warnings.push("dropped needs_memory: no memory_keys supplied".to_string());
            plan.needs_memory = false;
        }

        if plan.is_new_fact && (plan.new_fact_key.trim().is_empty() || plan.new_fact_value.trim().is_empty()) {
            // Resolution of Open Question #1: never invent a key for an
            // unnamed fact. The task lifecycle logs the dropped attempt.
            warnings.push("dropped is_new_fact: missing key or value".to_string());
            plan.is_new_fact = false;
        }

        if plan.hallucination_risk == HallucinationRisk::High && !plan.needs_memory {
            warnings.push(
                "high hallucination risk with no memory lookup requested; blocking for confirmation"
                    .to_string(),
            );
            plan.needs_sequential_thinking = true;
            plan.sequential_complexity = plan.sequential_complexity.max(7);
            return true;
        }

        false
    }

    // ── Tool normalization ───────────────────────────────────────────

    async fn normalize_tool_calls(&self, suggested: &[String], user_text: &str) -> Vec<ToolCall> {
        let mut seen = std::collections::HashSet::new();
        let mut calls = Vec::new();

        for raw in suggested {
            let Some(name) = clean_tool_name(raw) else {
                tracing::debug!(raw, "dropped unparseable tool name");
                continue;
            };
            if !seen.insert(name.clone()) {
                continue;
            }

            if !NATIVE_TOOL_ALLOWLIST.contains(&name.as_str())
                && self.mcp.get_mcp_for_tool(&name).await.is_none()
            {
                tracing::debug!(tool_name = %name, "dropped tool not advertised by any backend");
                continue;
            }

            let arguments = autofill_arguments(&name, user_text);
            calls.push(ToolCall {
                call_id: Uuid::new_v4().to_string(),
                tool_name: name,
                arguments,
            });
        }

        calls
    }

    // ── 3. Optional LLM verification ────────────────────────────────

    async fn llm_verify(
        &self,
        user_text: &str,
        plan: Plan,
        memory_excerpt: Option<&str>,
    ) -> (Plan, Option<String>) {
        let clipped_text: String = user_text.chars().take(500).collect();
        let clipped_memory: Option<String> = memory_excerpt.map(|m| m.chars().take(300).collect());

        let payload = json!({
            "user_text": clipped_text,
            "memory_excerpt": clipped_memory,
            "plan": {
                "intent": plan.intent,
                "hallucination_risk": plan.hallucination_risk,
                "suggested_tools": plan.suggested_tools,
            },
        });

        let req = ChatRequest {
            messages: vec![
                Message::system(
                    "Review this plan for correctness. Reply with JSON \
                     {\"corrected_intent\": string|null, \"warning\": string|null}.",
                ),
                Message::user(payload.to_string()),
            ],
            tools: vec![],
            temperature: Some(0.0),
            max_tokens: Some(200),
            json_mode: true,
            model: None,
        };

        let timeout = Duration::from_millis(self.control_timeout_ms);
        let call = self.router.chat_for_role("control", req);

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(resp)) => {
                let (value, _strategy) =
                    safe_parse_json(&resp.content, json!({}), "control_verify");
                let mut plan = plan;
                let mut warning = None;
                if let Some(corrected) = value.get("corrected_intent").and_then(Value::as_str) {
                    if !corrected.is_empty() {
                        plan.intent = corrected.to_string();
                    }
                }
                if let Some(w) = value.get("warning").and_then(Value::as_str) {
                    if !w.is_empty() {
                        warning = Some(w.to_string());
                    }
                }
                (plan, warning)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "control verification call failed, reusing plan as-is");
                (plan, Some("control verification unavailable, plan unverified".to_string()))
            }
            Err(_) => {
                tracing::warn!("control verification timed out, reusing plan as-is");
                (plan, Some("control verification timed out, plan unverified".to_string()))
            }
        }
    }
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap())
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\+?\d[\d\s().-]{7,}\d").unwrap())
}

fn credential_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(password|api[_-]?key|secret|token)\s*[:=]\s*\S+").unwrap()
    })
}

/// A bare identifier, allowing `call(...)`/`name: ...`/quoted-name noise
/// but rejecting anything with embedded spaces that reads as prose.
fn tool_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^['"]?([A-Za-z_][A-Za-z0-9_]*)"#).unwrap())
}

fn clean_tool_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let caps = tool_name_re().captures(trimmed)?;
    let whole = caps.get(0)?;
    let name = caps.get(1)?.as_str().to_string();

    // Accept plain identifiers, call syntax `name(...)`, key/value fragments
    // `name: ...`, and quoted names. Reject anything else trailing — that's
    // prose, not a tool reference.
    let rest = trimmed[whole.end()..].trim_start();
    match rest.chars().next() {
        None => Some(name),
        Some(c) if matches!(c, '(' | ':' | '=' | '"' | '\'') => Some(name),
        _ => None,
    }
}

fn autofill_arguments(tool_name: &str, user_text: &str) -> Value {
    if tool_name.contains("search") {
        json!({ "query": user_text })
    } else if tool_name.contains("think") {
        json!({ "message": user_text })
    } else {
        json!({})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_tool_name_accepts_plain_identifier() {
        assert_eq!(clean_tool_name("web_search"), Some("web_search".to_string()));
    }

    #[test]
    fn clean_tool_name_accepts_call_syntax() {
        assert_eq!(clean_tool_name("web_search(query=\"x\")"), Some("web_search".to_string()));
    }

    #[test]
    fn clean_tool_name_accepts_quoted_name() {
        assert_eq!(clean_tool_name("\"web_search\""), Some("web_search".to_string()));
    }

    #[test]
    fn clean_tool_name_rejects_prose() {
        assert_eq!(clean_tool_name("please search the web for me"), None);
    }

    #[test]
    fn autofill_search_uses_user_text_as_query() {
        let args = autofill_arguments("web_search", "rust traits");
        assert_eq!(args["query"], "rust traits");
    }

    #[test]
    fn autofill_unknown_tool_gets_empty_object() {
        let args = autofill_arguments("noop", "anything");
        assert_eq!(args, json!({}));
    }

    #[test]
    fn credential_scan_flags_api_key() {
        assert!(credential_re().is_match("api_key: sk-12345"));
        assert!(!credential_re().is_match("nothing sensitive here"));
    }

    #[test]
    fn high_risk_without_memory_forces_confirmation() {
        let registry = jarvis_providers::ProviderRegistry::from_config(&jarvis_domain::config::LlmConfig::default()).unwrap();
        let router = Arc::new(LlmRouter::new(registry, Default::default(), 30_000));
        let mcp = Arc::new(McpManager::empty());
        let cim = Arc::new(CimPolicyEngine::with_defaults().unwrap());
        let layer = ControlLayer::new(router, mcp, cim, 5_000);

        let mut plan = Plan {
            hallucination_risk: HallucinationRisk::High,
            needs_memory: false,
            ..Default::default()
        };
        let mut warnings = Vec::new();
        let forced = layer.quick_safety_checks("tell me something", &mut plan, &mut warnings);

        assert!(forced);
        assert!(plan.needs_sequential_thinking);
        assert!(!warnings.is_empty());
    }
}

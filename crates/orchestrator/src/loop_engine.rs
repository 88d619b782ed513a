//! ReAct loop engine: keeps one model session warm across tool rounds for
//! multi-step turns, instead of one model call per step.
//!
//! Per round: send the accumulated history with tools enabled, dispatch any
//! tool calls (deduped, stuck-detected, error-hinted), append results as
//! tool-role messages, repeat until the model stops calling tools or the
//! iteration budget runs out.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use jarvis_domain::error::Result;
use jarvis_domain::tool::{Message, ToolDefinition};
use jarvis_domain::trace::TraceEvent;
use jarvis_mcp::McpManager;
use jarvis_providers::{ChatRequest, LlmRouter};

/// Structured events the loop engine emits at every transition, forwarded
/// by the orchestrator for observability.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    LoopIteration { iteration: u32 },
    LoopToolCall { call_id: String, tool_name: String },
    LoopToolResult {
        call_id: String,
        tool_name: String,
        ok: bool,
        duration_ms: u64,
    },
    LoopStuckDetected { iteration: u32, tool_name: String },
    LoopMaxReached { reason: String },
    LoopError { message: String },
    Content { text: String },
    Done,
}

pub struct LoopEngine {
    router: Arc<LlmRouter>,
    mcp: Arc<McpManager>,
    max_iterations: u32,
    max_same_result: u32,
}

impl LoopEngine {
    pub fn new(router: Arc<LlmRouter>, mcp: Arc<McpManager>, max_iterations: u32, max_same_result: u32) -> Self {
        Self {
            router,
            mcp,
            max_iterations,
            max_same_result,
        }
    }

    /// Run the loop to completion, returning the final answer text plus the
    /// full event trace.
    pub async fn run(&self, turn_id: &str, mut messages: Vec<Message>) -> Result<(String, Vec<LoopEvent>)> {
        let mut events = Vec::new();
        let mut dedup_keys: HashSet<String> = HashSet::new();
        let mut signature_windows: HashMap<String, VecDeque<String>> = HashMap::new();
        let tool_defs = self.tool_definitions().await;

        for iteration in 1..=self.max_iterations {
            TraceEvent::LoopIteration {
                turn_id: turn_id.to_string(),
                iteration,
                same_result_count: 0,
            }
            .emit();
            events.push(LoopEvent::LoopIteration { iteration });

            let req = ChatRequest {
                messages: messages.clone(),
                tools: tool_defs.clone(),
                temperature: Some(0.2),
                max_tokens: None,
                json_mode: false,
                model: None,
            };
            let resp = self.router.chat_for_role("loop", req).await?;

            if resp.tool_calls.is_empty() {
                events.push(LoopEvent::Content { text: resp.content.clone() });
                events.push(LoopEvent::Done);
                return Ok((resp.content, events));
            }

            for call in resp.tool_calls {
                events.push(LoopEvent::LoopToolCall {
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                });
                TraceEvent::ToolDispatched {
                    turn_id: turn_id.to_string(),
                    tool_name: call.tool_name.clone(),
                    call_id: call.call_id.clone(),
                    transport: "mcp".to_string(),
                }
                .emit();

                let key = canonical_key(&call.tool_name, &call.arguments);
                if !dedup_keys.insert(key) {
                    messages.push(Message::tool_result(
                        call.call_id.clone(),
                        format!("ALREADY_EXECUTED: {} was already run this turn with the same arguments", call.tool_name),
                    ));
                    continue;
                }

                let start = Instant::now();
                let result = self.mcp.call_tool_by_name(&call.tool_name, call.arguments.clone()).await;
                let duration_ms = start.elapsed().as_millis() as u64;

                let reply = match result {
                    Ok(tool_result) => {
                        let ok = !tool_result.is_error;
                        events.push(LoopEvent::LoopToolResult {
                            call_id: call.call_id.clone(),
                            tool_name: call.tool_name.clone(),
                            ok,
                            duration_ms,
                        });
                        TraceEvent::ToolResult {
                            turn_id: turn_id.to_string(),
                            call_id: call.call_id.clone(),
                            ok,
                            duration_ms,
                        }
                        .emit();

                        let mut text = extract_text(&tool_result.content);
                        let signature = normalize_signature(&text);
                        let window = signature_windows.entry(call.tool_name.clone()).or_default();
                        window.push_back(signature.clone());
                        while window.len() as u32 > self.max_same_result {
                            window.pop_front();
                        }
                        let stuck = window.len() as u32 >= self.max_same_result
                            && window.iter().all(|s| s == &signature);

                        if stuck {
                            events.push(LoopEvent::LoopStuckDetected {
                                iteration,
                                tool_name: call.tool_name.clone(),
                            });
                            TraceEvent::LoopStuckDetected {
                                turn_id: turn_id.to_string(),
                                iteration,
                                tool_name: call.tool_name.clone(),
                            }
                            .emit();
                            text.push_str("\n[stuck: this tool returned the same result again — try a different approach]");
                        }
                        if !ok {
                            if let Some(hint) = alternative_hint(&text) {
                                text.push('\n');
                                text.push_str(hint);
                            }
                        }
                        text
                    }
                    Err(e) => {
                        let message = e.to_string();
                        events.push(LoopEvent::LoopError { message: message.clone() });
                        let mut text = format!("error: {message}");
                        if let Some(hint) = alternative_hint(&text) {
                            text.push('\n');
                            text.push_str(hint);
                        }
                        text
                    }
                };

                messages.push(Message::tool_result(call.call_id.clone(), reply));
            }
        }

        TraceEvent::LoopForcedFinish {
            turn_id: turn_id.to_string(),
            reason: "max iterations reached".to_string(),
        }
        .emit();
        events.push(LoopEvent::LoopMaxReached {
            reason: "max iterations reached".to_string(),
        });

        messages.push(Message::user(build_forced_finish_message(&events)));
        let req = ChatRequest {
            messages,
            tools: vec![],
            temperature: Some(0.2),
            max_tokens: None,
            json_mode: false,
            model: None,
        };
        let resp = self.router.chat_for_role("loop", req).await?;
        events.push(LoopEvent::Content { text: resp.content.clone() });
        events.push(LoopEvent::Done);
        Ok((resp.content, events))
    }

    async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.mcp
            .list_tools()
            .await
            .into_iter()
            .map(|(_, def)| ToolDefinition {
                name: def.name,
                description: def.description,
                parameters: def.input_schema,
            })
            .collect()
    }
}

/// Build the forced-finish instruction sent to the model once the iteration
/// budget runs out, folding in every stuck/error event collected during the
/// run so the final summary names what actually went wrong instead of
/// silently dropping the run's history.
fn build_forced_finish_message(events: &[LoopEvent]) -> String {
    let mut message = String::from(
        "You have reached the tool-call limit for this turn. Conclude now without calling \
         any more tools, summarizing what you found and any open issues.",
    );

    let stuck: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            LoopEvent::LoopStuckDetected { iteration, tool_name } => {
                Some(format!("{tool_name} stuck repeating the same result at iteration {iteration}"))
            }
            _ => None,
        })
        .collect();
    let errors: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            LoopEvent::LoopError { message } => Some(message.clone()),
            _ => None,
        })
        .collect();

    if !stuck.is_empty() || !errors.is_empty() {
        message.push_str("\n\nBefore you answer, account for these problems encountered this turn:");
        for s in &stuck {
            message.push_str("\n- ");
            message.push_str(s);
        }
        for e in &errors {
            message.push_str("\n- error: ");
            message.push_str(e);
        }
    }

    message
}

/// Dedup key: tool name plus canonical (sorted-key) JSON of its arguments.
/// `serde_json::Value`'s default map is a `BTreeMap`, so `to_string` already
/// emits keys in sorted order — no extra canonicalization pass needed.
fn canonical_key(tool_name: &str, arguments: &Value) -> String {
    format!("{tool_name}::{}", arguments)
}

fn extract_text(content: &[jarvis_mcp::protocol::ToolCallContent]) -> String {
    content
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn normalize_signature(text: &str) -> String {
    let stripped = number_re().replace_all(text, "#");
    let stripped = uuid_re().replace_all(&stripped, "#uuid#");
    stripped.trim().to_string()
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+(\.\d+)?").unwrap())
}

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}").unwrap()
    })
}

fn alternative_hint(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    if lower.contains("no module named") || lower.contains("modulenotfounderror") {
        Some("hint: the required module isn't installed — try an alternative tool or ask the user to install it")
    } else if lower.contains("connection refused") {
        Some("hint: the backend refused the connection; it may be down — try again later or a different tool")
    } else if lower.contains("permission denied") || lower.contains("403") {
        Some("hint: permission denied — this action needs access you don't have")
    } else if lower.contains("timeout") || lower.contains("timed out") {
        Some("hint: the call timed out — retry with a narrower scope or a different tool")
    } else if lower.contains("not found") || lower.contains("404") {
        Some("hint: the target wasn't found — double-check the identifier or path")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_is_order_independent_of_insertion() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(canonical_key("tool", &a), canonical_key("tool", &b));
    }

    #[test]
    fn normalize_signature_strips_numbers_and_uuids() {
        let text = "found 42 items, ref 123e4567-e89b-12d3-a456-426614174000";
        let normalized = normalize_signature(text);
        assert!(!normalized.contains("42"));
        assert!(!normalized.contains("123e4567"));
    }

    #[test]
    fn alternative_hint_maps_known_errors() {
        assert!(alternative_hint("Connection refused").is_some());
        assert!(alternative_hint("Permission denied (403)").is_some());
        assert!(alternative_hint("totally unknown failure mode").is_none());
    }

    #[test]
    fn forced_finish_message_folds_in_stuck_and_error_events() {
        let events = vec![
            LoopEvent::LoopIteration { iteration: 1 },
            LoopEvent::LoopStuckDetected { iteration: 3, tool_name: "web_search".into() },
            LoopEvent::LoopError { message: "connection refused".into() },
        ];
        let message = build_forced_finish_message(&events);
        assert!(message.contains("web_search stuck repeating"));
        assert!(message.contains("error: connection refused"));
    }

    #[test]
    fn forced_finish_message_is_plain_when_nothing_went_wrong() {
        let events = vec![LoopEvent::LoopIteration { iteration: 1 }];
        let message = build_forced_finish_message(&events);
        assert!(!message.contains("problems encountered"));
    }
}

//! Output layer: renders the final answer from a verified plan plus
//! whatever memory/tool context the orchestrator collected.
//!
//! Context is injected on a single channel — never twice — and chat
//! history is only appended when the plan asked for it via
//! `needs_chat_history`. Tools are never re-introduced here; by the time
//! Output runs, any tool results already live in the context block.

use std::sync::Arc;

use jarvis_domain::error::Result;
use jarvis_domain::plan::VerifiedPlan;
use jarvis_domain::tool::Message;
use jarvis_providers::{ChatRequest, LlmRouter};

/// Where the context text Output received came from, logged in the
/// `CTX-FINAL` marker for observability.
pub struct ContextInfo {
    pub mode: String,
    pub context_sources: Vec<String>,
    pub retrieval_count: usize,
}

impl ContextInfo {
    pub fn none() -> Self {
        Self {
            mode: "none".to_string(),
            context_sources: Vec::new(),
            retrieval_count: 0,
        }
    }
}

pub struct OutputLayer {
    router: Arc<LlmRouter>,
    persona: String,
    max_output_chars: usize,
}

impl OutputLayer {
    pub fn new(router: Arc<LlmRouter>, persona: impl Into<String>) -> Self {
        Self {
            router,
            persona: persona.into(),
            max_output_chars: 4000,
        }
    }

    pub fn with_char_budget(mut self, max_output_chars: usize) -> Self {
        self.max_output_chars = max_output_chars;
        self
    }

    pub async fn respond(
        &self,
        turn_id: &str,
        user_text: &str,
        verified: &VerifiedPlan,
        history: &[Message],
        context: Option<&str>,
        context_info: ContextInfo,
        memory_required_but_missing: bool,
    ) -> Result<String> {
        let system_prompt = self.build_system_prompt(verified, context, memory_required_but_missing);

        let mut messages = vec![Message::system(system_prompt)];
        if verified.plan.needs_chat_history {
            messages.extend(history.iter().cloned());
        }
        messages.push(Message::user(user_text));

        let req = ChatRequest {
            messages,
            tools: vec![],
            temperature: Some(0.7),
            max_tokens: None,
            json_mode: false,
            model: None,
        };

        let resp = self.router.chat_for_role("output", req).await?;
        let capped = cap_chars(&resp.content, self.max_output_chars);

        tracing::info!(
            turn_id,
            mode = %context_info.mode,
            context_sources = ?context_info.context_sources,
            payload_chars = context.map(str::len).unwrap_or(0),
            retrieval_count = context_info.retrieval_count,
            "CTX-FINAL"
        );

        Ok(capped)
    }

    fn build_system_prompt(
        &self,
        verified: &VerifiedPlan,
        context: Option<&str>,
        memory_required_but_missing: bool,
    ) -> String {
        let mut prompt = self.persona.clone();
        prompt.push('\n');

        if !verified.final_instruction.is_empty() {
            prompt.push_str("\nCurrent instruction: ");
            prompt.push_str(&verified.final_instruction);
            prompt.push('\n');
        }

        if let Some(ctx) = context {
            if !ctx.is_empty() {
                prompt.push_str("\nRelevant context:\n");
                prompt.push_str(ctx);
                prompt.push('\n');
            }
        }

        if let Some(time_ref) = &verified.plan.time_reference {
            prompt.push_str("\nThe user's message refers to this day: ");
            prompt.push_str(time_ref);
            prompt.push('\n');
        }

        if memory_required_but_missing {
            prompt.push_str(
                "\nThe user's request needed a stored fact, but nothing was found for it. \
                 Do not invent an answer — say plainly that it isn't stored.\n",
            );
        }

        if !verified.warnings.is_empty() {
            prompt.push_str("\nNote the following before answering:\n");
            for warning in &verified.warnings {
                prompt.push_str("- ");
                prompt.push_str(warning);
                prompt.push('\n');
            }
        }

        if !verified.plan.suggested_response_style.is_empty() {
            prompt.push_str("\nResponse style: ");
            prompt.push_str(&verified.plan.suggested_response_style);
            prompt.push('\n');
        }

        prompt
    }
}

fn cap_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_chars_leaves_short_text_untouched() {
        assert_eq!(cap_chars("hello", 10), "hello");
    }

    #[test]
    fn cap_chars_truncates_long_text() {
        assert_eq!(cap_chars("hello world", 5), "hello");
    }

    #[test]
    fn context_info_none_has_zero_retrieval() {
        let info = ContextInfo::none();
        assert_eq!(info.retrieval_count, 0);
        assert_eq!(info.mode, "none");
    }
}

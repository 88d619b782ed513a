//! The Orchestrator: drives one turn through Thinking → Control →
//! (tool execution or the ReAct loop) → Output, streaming events back to
//! the caller over a channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use jarvis_domain::config::OrchestratorConfig;
use jarvis_domain::tool::Message;
use jarvis_domain::trace::TraceEvent;
use jarvis_mcp::McpManager;
use jarvis_providers::LlmRouter;

use crate::cim_policy::CimPolicyEngine;
use crate::control::ControlLayer;
use crate::loop_engine::{LoopEngine, LoopEvent};
use crate::output::{ContextInfo, OutputLayer};
use crate::thinking::{RuleInjection, ThinkingLayer};

/// Lightweight cooperative cancellation: the caller disconnecting sets
/// this, and the turn's suspension points check it at the next resume
/// point rather than being interrupted mid-flight.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Hook the task-lifecycle manager implements; the orchestrator only ever
/// submits start/finish events and never owns task state itself.
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn start_task(&self, request_id: &str, conversation_id: &str, user_text: &str);
    async fn finish_task(&self, request_id: &str, result: Option<&str>, error: Option<&str>);
}

/// Default sink for callers that haven't wired task lifecycle yet.
pub struct NoopTaskSink;

#[async_trait]
impl TaskSink for NoopTaskSink {
    async fn start_task(&self, _request_id: &str, _conversation_id: &str, _user_text: &str) {}
    async fn finish_task(&self, _request_id: &str, _result: Option<&str>, _error: Option<&str>) {}
}

/// Events streamed back over the course of one turn.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OrchestratorEvent {
    #[serde(rename = "plan_ready")]
    PlanReady { intent: String, hallucination_risk: String },
    #[serde(rename = "blocked")]
    Blocked { reason: String },
    #[serde(rename = "tool_call")]
    ToolCall { call_id: String, tool_name: String },
    #[serde(rename = "tool_result")]
    ToolResult { call_id: String, tool_name: String, ok: bool },
    #[serde(rename = "loop_iteration")]
    LoopIteration { iteration: u32 },
    #[serde(rename = "loop_stuck_detected")]
    LoopStuckDetected { iteration: u32, tool_name: String },
    #[serde(rename = "loop_max_reached")]
    LoopMaxReached { reason: String },
    #[serde(rename = "final")]
    Final { content: String },
    #[serde(rename = "stopped")]
    Stopped { content: String },
    #[serde(rename = "error")]
    Error { message: String },
}

fn loop_event_to_orchestrator(e: LoopEvent) -> Option<OrchestratorEvent> {
    match e {
        LoopEvent::LoopIteration { iteration } => Some(OrchestratorEvent::LoopIteration { iteration }),
        LoopEvent::LoopToolCall { call_id, tool_name } => Some(OrchestratorEvent::ToolCall { call_id, tool_name }),
        LoopEvent::LoopToolResult { call_id, tool_name, ok, .. } => {
            Some(OrchestratorEvent::ToolResult { call_id, tool_name, ok })
        }
        LoopEvent::LoopStuckDetected { iteration, tool_name } => {
            Some(OrchestratorEvent::LoopStuckDetected { iteration, tool_name })
        }
        LoopEvent::LoopMaxReached { reason } => Some(OrchestratorEvent::LoopMaxReached { reason }),
        LoopEvent::LoopError { message } => Some(OrchestratorEvent::Error { message }),
        LoopEvent::Content { .. } | LoopEvent::Done => None,
    }
}

/// Input to a single turn.
pub struct TurnInput {
    pub conversation_id: String,
    pub user_text: String,
    pub history: Vec<Message>,
    pub available_skills: Vec<String>,
    pub rule_injection: RuleInjection,
}

pub struct Orchestrator {
    thinking: ThinkingLayer,
    control: ControlLayer,
    loop_engine: LoopEngine,
    output: OutputLayer,
    mcp: Arc<McpManager>,
    task_sink: Arc<dyn TaskSink>,
    memory_char_cap: usize,
    complexity_threshold: u8,
}

impl Orchestrator {
    pub fn new(
        router: Arc<LlmRouter>,
        mcp: Arc<McpManager>,
        cim: Arc<CimPolicyEngine>,
        config: &OrchestratorConfig,
        persona: impl Into<String>,
        task_sink: Arc<dyn TaskSink>,
    ) -> Self {
        let control = ControlLayer::new(router.clone(), mcp.clone(), cim, config.control_timeout_ms);
        let loop_engine = LoopEngine::new(
            router.clone(),
            mcp.clone(),
            config.max_loop_iterations,
            config.max_same_result,
        );
        let output = OutputLayer::new(router.clone(), persona);
        let thinking = ThinkingLayer::new(router, mcp.clone());

        Self {
            thinking,
            control,
            loop_engine,
            output,
            mcp,
            task_sink,
            memory_char_cap: 4000,
            complexity_threshold: 7,
        }
    }

    /// Start one turn. Returns a turn id, a [`CancelToken`] the caller can
    /// use to request cooperative cancellation (e.g. on disconnect), and a
    /// receiver of events; the caller drains it for streaming, or collects
    /// it fully for a synchronous response.
    pub fn run(self: Arc<Self>, input: TurnInput) -> (Uuid, CancelToken, mpsc::Receiver<OrchestratorEvent>) {
        let turn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancelToken::new();
        let cancel_for_task = cancel.clone();

        let span = tracing::info_span!("turn", %turn_id, conversation_id = %input.conversation_id);
        tokio::spawn(
            async move {
                let request_id = turn_id.to_string();
                self.task_sink
                    .start_task(&request_id, &input.conversation_id, &input.user_text)
                    .await;

                let result = self
                    .run_inner(&turn_id.to_string(), &input, &tx, &cancel_for_task)
                    .await;

                match &result {
                    Ok(content) => {
                        self.task_sink.finish_task(&request_id, Some(content), None).await;
                    }
                    Err(e) => {
                        self.task_sink.finish_task(&request_id, None, Some(&e.to_string())).await;
                        let _ = tx.send(OrchestratorEvent::Error { message: e.to_string() }).await;
                    }
                }
            }
            .instrument(span),
        );

        (turn_id, cancel, rx)
    }

    /// Non-streaming convenience wrapper: runs the turn to completion and
    /// returns the final text, discarding intermediate events. Adapters that
    /// don't need a live event stream (a plain request/response HTTP
    /// endpoint, a CLI one-shot) use this instead of draining `run()`
    /// themselves.
    pub async fn process(self: Arc<Self>, input: TurnInput) -> jarvis_domain::error::Result<String> {
        let (_turn_id, _cancel, mut rx) = self.run(input);
        let mut last_error = None;
        while let Some(event) = rx.recv().await {
            match event {
                OrchestratorEvent::Final { content } | OrchestratorEvent::Stopped { content } => {
                    return Ok(content);
                }
                OrchestratorEvent::Error { message } => last_error = Some(message),
                _ => {}
            }
        }
        match last_error {
            Some(message) => Err(jarvis_domain::error::Error::Other(message)),
            None => Ok(String::new()),
        }
    }

    async fn run_inner(
        &self,
        turn_id: &str,
        input: &TurnInput,
        tx: &mpsc::Sender<OrchestratorEvent>,
        cancel: &CancelToken,
    ) -> jarvis_domain::error::Result<String> {
        // Step 1: Thinking.
        let (plan, parse_strategy) = self
            .thinking
            .think(turn_id, &input.user_text, None, input.rule_injection)
            .await?;

        let _ = tx
            .send(OrchestratorEvent::PlanReady {
                intent: plan.intent.clone(),
                hallucination_risk: format!("{:?}", plan.hallucination_risk).to_lowercase(),
            })
            .await;

        if cancel.is_cancelled() {
            let _ = tx.send(OrchestratorEvent::Stopped { content: String::new() }).await;
            return Ok(String::new());
        }

        // Step 2: bounded memory fetch.
        let needs_memory_requested = plan.needs_memory;
        let (memory_context, retrieval_count) = self.fetch_memory(&plan.memory_keys).await;
        let memory_required_but_missing = needs_memory_requested && memory_context.is_none();

        // Step 3: Control.
        let (verified, tool_calls) = self
            .control
            .verify(
                turn_id,
                &input.user_text,
                plan,
                parse_strategy,
                memory_context.as_deref(),
                &input.available_skills,
            )
            .await;

        if verified.needs_skill_confirmation {
            let reason = verified
                .cim_decision
                .as_ref()
                .map(|d| d.reason.clone())
                .unwrap_or_else(|| "this action requires confirmation before it can run".to_string());
            let _ = tx.send(OrchestratorEvent::Blocked { reason: reason.clone() }).await;
            return Ok(format!("I need your confirmation before I can do that: {reason}"));
        }

        if cancel.is_cancelled() {
            let _ = tx.send(OrchestratorEvent::Stopped { content: String::new() }).await;
            return Ok(String::new());
        }

        // Step 4: loop-engine threshold.
        let complexity = verified.plan.sequential_complexity;
        let wants_loop = complexity >= self.complexity_threshold
            || (verified.plan.needs_sequential_thinking && tool_calls.len() >= 2);

        let (tool_context, tool_sources, tool_retrieval) = if wants_loop {
            let mut messages = vec![Message::system(verified.final_instruction.clone())];
            messages.push(Message::user(input.user_text.clone()));
            let (final_text, events) = self.loop_engine.run(turn_id, messages).await?;
            for event in events {
                if let Some(oe) = loop_event_to_orchestrator(event) {
                    let _ = tx.send(oe).await;
                }
            }
            (Some(final_text), vec!["loop_engine".to_string()], 1)
        } else if !tool_calls.is_empty() {
            let (text, count) = self.execute_tools(turn_id, tx, &tool_calls).await;
            (Some(text), vec!["tools".to_string()], count)
        } else {
            (None, Vec::new(), 0)
        };

        if cancel.is_cancelled() {
            let _ = tx.send(OrchestratorEvent::Stopped { content: String::new() }).await;
            return Ok(String::new());
        }

        // Step 6: Output.
        let mut context_parts = Vec::new();
        let mut sources = Vec::new();
        if let Some(mem) = &memory_context {
            context_parts.push(mem.clone());
            sources.push("memory".to_string());
        }
        if let Some(tools) = &tool_context {
            context_parts.push(tools.clone());
            sources.extend(tool_sources);
        }
        let context = if context_parts.is_empty() {
            None
        } else {
            Some(context_parts.join("\n\n"))
        };

        let mode = match (memory_context.is_some(), tool_context.is_some()) {
            (true, true) => "memory_and_tools",
            (true, false) => "memory_only",
            (false, true) => "tools_only",
            (false, false) => "none",
        };

        let context_info = ContextInfo {
            mode: mode.to_string(),
            context_sources: sources,
            retrieval_count: retrieval_count + tool_retrieval,
        };

        let final_text = self
            .output
            .respond(
                turn_id,
                &input.user_text,
                &verified,
                &input.history,
                context.as_deref(),
                context_info,
                memory_required_but_missing,
            )
            .await?;

        let _ = tx.send(OrchestratorEvent::Final { content: final_text.clone() }).await;

        Ok(final_text)
    }

    async fn fetch_memory(&self, memory_keys: &[String]) -> (Option<String>, usize) {
        if memory_keys.is_empty() {
            return (None, 0);
        }
        let mut chunks = Vec::new();
        for key in memory_keys.iter().take(8) {
            match self
                .mcp
                .call_tool_by_name("memory_get", serde_json::json!({ "key": key }))
                .await
            {
                Ok(result) if !result.is_error => {
                    let text: String = result
                        .content
                        .iter()
                        .map(|c| c.text.as_str())
                        .collect::<Vec<_>>()
                        .join("\n");
                    if !text.is_empty() {
                        chunks.push(text);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(key, error = %e, "memory fetch failed, skipping key");
                }
            }
        }
        if chunks.is_empty() {
            return (None, 0);
        }
        let count = chunks.len();
        let mut joined = chunks.join("\n---\n");
        if joined.len() > self.memory_char_cap {
            joined.truncate(self.memory_char_cap);
        }
        (Some(joined), count)
    }

    /// Execute independent tool calls concurrently via the Hub; results are
    /// merged in the order `suggested_tools` was given, per the ordering
    /// guarantee in the concurrency model.
    async fn execute_tools(
        &self,
        turn_id: &str,
        tx: &mpsc::Sender<OrchestratorEvent>,
        tool_calls: &[jarvis_domain::tool::ToolCall],
    ) -> (String, usize) {
        let futures = tool_calls.iter().map(|call| {
            let mcp = self.mcp.clone();
            let call = call.clone();
            async move {
                let start = Instant::now();
                let result = mcp.call_tool_by_name(&call.tool_name, call.arguments.clone()).await;
                (call, result, start.elapsed().as_millis() as u64)
            }
        });

        let results = futures_util::future::join_all(futures).await;

        let mut segments = Vec::with_capacity(results.len());
        for (call, result, duration_ms) in results {
            let _ = tx
                .send(OrchestratorEvent::ToolCall {
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                })
                .await;
            TraceEvent::ToolDispatched {
                turn_id: turn_id.to_string(),
                tool_name: call.tool_name.clone(),
                call_id: call.call_id.clone(),
                transport: "mcp".to_string(),
            }
            .emit();

            let ok = match &result {
                Ok(r) => !r.is_error,
                Err(_) => false,
            };
            TraceEvent::ToolResult {
                turn_id: turn_id.to_string(),
                call_id: call.call_id.clone(),
                ok,
                duration_ms,
            }
            .emit();
            let _ = tx
                .send(OrchestratorEvent::ToolResult {
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    ok,
                })
                .await;

            let text = match result {
                Ok(r) => r.content.into_iter().map(|c| c.text).collect::<Vec<_>>().join("\n"),
                Err(e) => format!("error calling {}: {e}", call.tool_name),
            };
            segments.push(format!("[{}] {}", call.tool_name, text));
        }

        let count = segments.len();
        (segments.join("\n\n"), count)
    }
}

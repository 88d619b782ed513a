use serde::Serialize;

/// Structured trace events emitted across all jarvis crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    ThinkingStarted {
        turn_id: String,
        model: String,
    },
    PlanParsed {
        turn_id: String,
        parse_strategy: String,
        hallucination_risk: String,
    },
    ControlDecision {
        turn_id: String,
        action: String,
        requires_confirmation: bool,
        time_reference: Option<String>,
    },
    ToolDispatched {
        turn_id: String,
        tool_name: String,
        call_id: String,
        transport: String,
    },
    ToolResult {
        turn_id: String,
        call_id: String,
        ok: bool,
        duration_ms: u64,
    },
    LoopIteration {
        turn_id: String,
        iteration: u32,
        same_result_count: u32,
    },
    LoopStuckDetected {
        turn_id: String,
        iteration: u32,
        tool_name: String,
    },
    LoopForcedFinish {
        turn_id: String,
        reason: String,
    },
    TaskFlushed {
        task_id: String,
        status: String,
    },
    GraphHygieneApplied {
        candidates_in: usize,
        candidates_kept: usize,
        candidates_dropped: usize,
    },
    CimDecisionMade {
        pattern_id: Option<String>,
        action: String,
        matched: bool,
    },
    LlmRequest {
        provider: String,
        model: String,
        role: String,
        streaming: bool,
        duration_ms: u64,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    },
    LlmFallback {
        from_provider: String,
        from_model: String,
        to_provider: String,
        to_model: String,
        reason: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "jarvis_event");
    }
}

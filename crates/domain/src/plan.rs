use crate::cim::CIMDecision;
use serde::{Deserialize, Serialize};

/// Output of the Thinking layer: a structured interpretation of the user's
/// request plus routing hints for Control.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Plan {
    /// Short restatement of what the user wants, used for stuck-loop logging
    /// and for the forced-finish summary if the loop runs out of iterations.
    pub intent: String,

    /// Ordered list of tool names Thinking believes are relevant. Control is
    /// free to ignore this; it is a hint, not a contract.
    #[serde(default)]
    pub suggested_tools: Vec<String>,

    /// Whether Thinking judged this request as needing recent chat turns to
    /// disambiguate (pronouns, "that", "again", etc.).
    #[serde(default)]
    pub needs_chat_history: bool,

    /// CIM modes Thinking flagged as plausibly relevant for this request,
    /// e.g. `["destructive_fs", "network_egress"]`. Advisory only — the CIM
    /// policy engine re-derives its own decision from the actual tool call.
    #[serde(default)]
    pub suggested_cim_modes: Vec<String>,

    /// Free-form chain-of-thought text captured for audit/debug purposes.
    /// Never shown to the end user.
    #[serde(default)]
    pub reasoning: String,

    /// Thinking's self-estimate of how likely this plan is to be grounded in
    /// fact vs. fabricated. Used to decide whether Control should require a
    /// verifying tool call before acting.
    #[serde(default)]
    pub hallucination_risk: HallucinationRisk,

    /// A relative or absolute date Thinking extracted and normalized against
    /// the current session clock: `"today"`, `"yesterday"`,
    /// `"day_before_yesterday"`, an ISO date (`"2026-07-29"`), or `None` when
    /// the request carries no time reference at all.
    #[serde(default)]
    pub time_reference: Option<String>,

    /// Whether this turn needs a memory lookup before Control/Output run.
    /// Invariant: if true, `memory_keys` must be non-empty — Control drops
    /// the flag back to false otherwise rather than querying with no key.
    #[serde(default)]
    pub needs_memory: bool,

    /// Ordered, deduplicated memory keys to fetch. Bounded to 8 entries by
    /// the orchestrator's memory-fetch step regardless of how many Thinking
    /// suggested.
    #[serde(default)]
    pub memory_keys: Vec<String>,

    /// Whether the user is asking about a previously stored fact (as opposed
    /// to asking the system to store one).
    #[serde(default)]
    pub is_fact_query: bool,

    /// Whether the user is asserting a new fact to remember. Requires
    /// `new_fact_key`/`new_fact_value`; Control drops a plan that sets this
    /// with an empty key rather than inventing one (see DESIGN.md).
    #[serde(default)]
    pub is_new_fact: bool,

    #[serde(default)]
    pub new_fact_key: String,

    #[serde(default)]
    pub new_fact_value: String,

    /// Whether the request looks complex enough to warrant the ReAct loop
    /// engine rather than the single-pass tool-execution path.
    #[serde(default)]
    pub needs_sequential_thinking: bool,

    /// 0–10 complexity estimate; the orchestrator hands off to the loop
    /// engine when this crosses its configured threshold.
    #[serde(default)]
    pub sequential_complexity: u8,

    /// Free-form style hint forwarded to the Output layer's prompt (e.g.
    /// "kurz", "technisch", "locker").
    #[serde(default)]
    pub suggested_response_style: String,

    /// Coarse classification of the kind of reasoning this turn requires,
    /// kept for observability rather than branching logic.
    #[serde(default)]
    pub reasoning_type: String,
}

/// Thinking's confidence that its own plan is grounded rather than invented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HallucinationRisk {
    Low,
    #[default]
    Medium,
    High,
}

/// A `Plan` that has survived the robust-JSON parsing cascade and passed
/// minimal shape validation. Distinguishing this from `Plan` keeps
/// "parsed but unverified" out of the loop engine's hands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedPlan {
    pub plan: Plan,

    /// Which parsing strategy produced this plan: `direct`, `brace_extract`,
    /// `markdown_fence`, `repair`, or `regex_kv`. Kept for diagnostics — a
    /// plan parsed via `regex_kv` is weaker evidence than `direct`.
    pub parse_strategy: String,

    /// Control's final instruction text handed to Output, already merged
    /// with any correction it produced.
    #[serde(default)]
    pub final_instruction: String,

    /// Non-fatal warnings accumulated while verifying the plan (clipped
    /// text, skipped LLM verification on timeout, dropped empty fact key…).
    #[serde(default)]
    pub warnings: Vec<String>,

    /// The CIM policy decision that fired for this turn, if any pattern
    /// matched with sufficient confidence.
    #[serde(default)]
    pub cim_decision: Option<CIMDecision>,

    /// Set when a matched policy requires user confirmation before its
    /// action may run. The caller must clear this (by re-submitting the
    /// turn with confirmation granted) before the action executes.
    #[serde(default)]
    pub needs_skill_confirmation: bool,
}

impl VerifiedPlan {
    /// Wrap a plan as verified with no corrections, warnings, or CIM match —
    /// the common case for a turn the policy engine and LLM verification
    /// both wave through untouched.
    pub fn passthrough(plan: Plan, parse_strategy: impl Into<String>) -> Self {
        Self {
            plan,
            parse_strategy: parse_strategy.into(),
            final_instruction: String::new(),
            warnings: Vec::new(),
            cim_decision: None,
            needs_skill_confirmation: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hallucination_risk_defaults_medium() {
        assert_eq!(HallucinationRisk::default(), HallucinationRisk::Medium);
    }

    #[test]
    fn plan_round_trips_through_json() {
        let plan = Plan {
            intent: "list files in /tmp".into(),
            suggested_tools: vec!["exec".into()],
            needs_chat_history: false,
            suggested_cim_modes: vec!["destructive_fs".into()],
            reasoning: "user asked to enumerate a directory".into(),
            hallucination_risk: HallucinationRisk::Low,
            time_reference: Some("yesterday".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.intent, plan.intent);
        assert_eq!(back.hallucination_risk, HallucinationRisk::Low);
        assert_eq!(back.time_reference, plan.time_reference);
    }

    #[test]
    fn time_reference_defaults_to_none() {
        let plan = Plan::default();
        assert_eq!(plan.time_reference, None);
    }
}

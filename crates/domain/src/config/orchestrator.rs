use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator / ReAct loop configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Loop-engine thresholds plus the per-layer timeout budget. Every field has
/// a literal default drawn from the exhaustive timeout table so a bare
/// `{}` config still behaves sanely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "d_max_loop_iterations")]
    pub max_loop_iterations: u32,
    #[serde(default = "d_max_same_result")]
    pub max_same_result: u32,

    #[serde(default = "d_thinking_timeout_ms")]
    pub thinking_timeout_ms: u64,
    #[serde(default = "d_control_timeout_ms")]
    pub control_timeout_ms: u64,
    #[serde(default = "d_output_timeout_ms")]
    pub output_timeout_ms: u64,
    #[serde(default = "d_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    #[serde(default = "d_tool_streaming_timeout_ms")]
    pub tool_streaming_timeout_ms: u64,
    #[serde(default = "d_stdio_timeout_ms")]
    pub stdio_timeout_ms: u64,
    #[serde(default = "d_sqlite_busy_timeout_ms")]
    pub sqlite_busy_timeout_ms: u64,
    #[serde(default = "d_subprocess_init_timeout_ms")]
    pub subprocess_init_timeout_ms: u64,

    /// Model name used for the Thinking role, e.g. `llama3.1:70b`. Resolved
    /// from `THINKING_MODEL` at load time if left at its default.
    #[serde(default = "d_thinking_model")]
    pub thinking_model: String,
    /// Model name used for the Control role. Resolved from `CONTROL_MODEL`.
    #[serde(default = "d_control_model")]
    pub control_model: String,
    /// Model name used for the Output role. Resolved from `OUTPUT_MODEL`.
    #[serde(default = "d_output_model")]
    pub output_model: String,

    /// Base URL of the Ollama server. Resolved from `OLLAMA_BASE`.
    #[serde(default = "d_ollama_base")]
    pub ollama_base: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: d_max_loop_iterations(),
            max_same_result: d_max_same_result(),
            thinking_timeout_ms: d_thinking_timeout_ms(),
            control_timeout_ms: d_control_timeout_ms(),
            output_timeout_ms: d_output_timeout_ms(),
            tool_timeout_ms: d_tool_timeout_ms(),
            tool_streaming_timeout_ms: d_tool_streaming_timeout_ms(),
            stdio_timeout_ms: d_stdio_timeout_ms(),
            sqlite_busy_timeout_ms: d_sqlite_busy_timeout_ms(),
            subprocess_init_timeout_ms: d_subprocess_init_timeout_ms(),
            thinking_model: d_thinking_model(),
            control_model: d_control_model(),
            output_model: d_output_model(),
            ollama_base: d_ollama_base(),
        }
    }
}

fn d_max_loop_iterations() -> u32 {
    5
}
fn d_max_same_result() -> u32 {
    2
}
fn d_thinking_timeout_ms() -> u64 {
    90_000
}
fn d_control_timeout_ms() -> u64 {
    30_000
}
fn d_output_timeout_ms() -> u64 {
    120_000
}
fn d_tool_timeout_ms() -> u64 {
    30_000
}
fn d_tool_streaming_timeout_ms() -> u64 {
    300_000
}
fn d_stdio_timeout_ms() -> u64 {
    30_000
}
fn d_sqlite_busy_timeout_ms() -> u64 {
    5_000
}
fn d_subprocess_init_timeout_ms() -> u64 {
    60_000
}
fn d_thinking_model() -> String {
    std::env::var("THINKING_MODEL").unwrap_or_else(|_| "llama3.1".into())
}
fn d_control_model() -> String {
    std::env::var("CONTROL_MODEL").unwrap_or_else(|_| "llama3.1".into())
}
fn d_output_model() -> String {
    std::env::var("OUTPUT_MODEL").unwrap_or_else(|_| "llama3.1".into())
}
fn d_ollama_base() -> String {
    std::env::var("OLLAMA_BASE").unwrap_or_else(|_| "http://localhost:11434".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_timeout_table() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.max_loop_iterations, 5);
        assert_eq!(cfg.max_same_result, 2);
        assert_eq!(cfg.thinking_timeout_ms, 90_000);
        assert_eq!(cfg.control_timeout_ms, 30_000);
        assert_eq!(cfg.output_timeout_ms, 120_000);
        assert_eq!(cfg.tool_timeout_ms, 30_000);
        assert_eq!(cfg.tool_streaming_timeout_ms, 300_000);
        assert_eq!(cfg.stdio_timeout_ms, 30_000);
        assert_eq!(cfg.sqlite_busy_timeout_ms, 5_000);
        assert_eq!(cfg.subprocess_init_timeout_ms, 60_000);
    }

    #[test]
    fn deserialize_missing_fields_uses_defaults() {
        let cfg: OrchestratorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_loop_iterations, 5);
    }
}

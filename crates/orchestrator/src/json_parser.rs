//! Robust JSON extraction from raw model output.
//!
//! Models asked to emit JSON still wrap it in prose, markdown fences, or
//! leave python-style literals and trailing commas behind. This module runs
//! a cascade of increasingly permissive strategies and never raises — a
//! caller always gets back a `serde_json::Value`, falling back to a
//! caller-supplied default when every strategy fails.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Which strategy produced a parsed value. Kept by callers (see
/// [`jarvis_domain::plan::VerifiedPlan::parse_strategy`]) as a confidence
/// signal — `regex_kv` is much weaker evidence than `direct`.
pub const STRATEGY_DIRECT: &str = "direct";
pub const STRATEGY_BRACE_EXTRACT: &str = "brace_extract";
pub const STRATEGY_MARKDOWN_FENCE: &str = "markdown_fence";
pub const STRATEGY_REPAIR: &str = "repair";
pub const STRATEGY_REGEX_KV: &str = "regex_kv";
pub const STRATEGY_DEFAULT: &str = "default";

/// Parse `raw` into a JSON object, trying increasingly permissive recovery
/// strategies. Returns `(value, strategy_name)`; on total failure, returns
/// `(default, "default")` and logs the first 200 chars of input for
/// debugging.
pub fn safe_parse_json(raw: &str, default: Value, context: &str) -> (Value, &'static str) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        tracing::warn!(context, "safe_parse_json: empty input, using default");
        return (default, STRATEGY_DEFAULT);
    }

    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return (v, STRATEGY_DIRECT);
        }
    }

    if let Some(v) = extract_braces(trimmed) {
        return (v, STRATEGY_BRACE_EXTRACT);
    }

    if let Some(v) = extract_markdown_fence(trimmed) {
        return (v, STRATEGY_MARKDOWN_FENCE);
    }

    if let Some(v) = attempt_repair(trimmed) {
        return (v, STRATEGY_REPAIR);
    }

    if let Some(v) = extract_key_values(trimmed) {
        return (v, STRATEGY_REGEX_KV);
    }

    let preview: String = trimmed.chars().take(200).collect();
    tracing::warn!(context, preview = %preview, "safe_parse_json: all strategies failed, using default");
    (default, STRATEGY_DEFAULT)
}

/// Parse `raw` into a JSON array, with a simpler recovery cascade than
/// [`safe_parse_json`]: direct parse, then a top-level `[`...`]` slice, then
/// a comma-separated fallback for bare lists with no brackets at all.
pub fn extract_json_array(raw: &str, default: Value) -> Value {
    let trimmed = raw.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_array() {
            return v;
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if end > start {
            if let Ok(v) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                if v.is_array() {
                    return v;
                }
            }
        }
    }

    if !trimmed.contains('[') && trimmed.contains(',') {
        let items: Vec<Value> = trimmed
            .split(',')
            .map(|s| Value::String(s.trim().trim_matches('"').to_string()))
            .filter(|v| !matches!(v, Value::String(s) if s.is_empty()))
            .collect();
        if !items.is_empty() {
            return Value::Array(items);
        }
    }

    default
}

// ── Strategy 2: brace extraction ────────────────────────────────────

fn extract_braces(s: &str) -> Option<Value> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end <= start {
        return None;
    }
    let candidate = &s[start..=end];
    let v: Value = serde_json::from_str(candidate).ok()?;
    v.is_object().then_some(v)
}

// ── Strategy 3: fenced markdown block ───────────────────────────────

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:json)?\s*(\{[\s\S]*?\})\s*```").unwrap())
}

fn extract_markdown_fence(s: &str) -> Option<Value> {
    let caps = fence_re().captures(s)?;
    let candidate = caps.get(1)?.as_str();
    let v: Value = serde_json::from_str(candidate).ok()?;
    v.is_object().then_some(v)
}

// ── Strategy 4: repair ───────────────────────────────────────────────

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",(\s*[}\]])").unwrap())
}

fn bare_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?P<pre>[{,]\s*)(?P<key>[A-Za-z_][A-Za-z0-9_]*)(?P<post>\s*:)"#).unwrap())
}

/// Best-effort repair of common "almost JSON" mistakes: trailing commas,
/// python-style `True`/`False`/`None` literals, unquoted object keys, and
/// single-quoted strings (only swapped when the input has no double quotes
/// at all, to avoid mangling strings that legitimately contain apostrophes).
fn attempt_repair(s: &str) -> Option<Value> {
    let (start, end) = (s.find('{')?, s.rfind('}')?);
    if end <= start {
        return None;
    }
    let mut candidate = s[start..=end].to_string();

    candidate = trailing_comma_re().replace_all(&candidate, "$1").to_string();

    candidate = candidate
        .replace("True", "true")
        .replace("False", "false")
        .replace("None", "null");

    candidate = bare_key_re()
        .replace_all(&candidate, r#"${pre}"${key}"${post}"#)
        .to_string();

    if !candidate.contains('"') && candidate.contains('\'') {
        candidate = candidate.replace('\'', "\"");
    }

    let v: Value = serde_json::from_str(&candidate).ok()?;
    v.is_object().then_some(v)
}

// ── Strategy 5: regex key/value extraction ──────────────────────────

fn kv_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            // "key": "value"
            Regex::new(r#""(?P<key>[A-Za-z_][A-Za-z0-9_]*)"\s*:\s*"(?P<val>[^"]*)""#).unwrap(),
            // key: "value"  (unquoted key)
            Regex::new(r#"(?P<key>[A-Za-z_][A-Za-z0-9_]*)\s*:\s*"(?P<val>[^"]*)""#).unwrap(),
            // "key": true/false
            Regex::new(r#""(?P<key>[A-Za-z_][A-Za-z0-9_]*)"\s*:\s*(?P<val>true|false)"#).unwrap(),
            // "key": 123 / 1.5
            Regex::new(r#""(?P<key>[A-Za-z_][A-Za-z0-9_]*)"\s*:\s*(?P<val>-?\d+(?:\.\d+)?)"#)
                .unwrap(),
            // key: 123  (unquoted key, numeric value)
            Regex::new(r#"(?P<key>[A-Za-z_][A-Za-z0-9_]*)\s*:\s*(?P<val>-?\d+(?:\.\d+)?)"#)
                .unwrap(),
        ]
    })
}

fn extract_key_values(s: &str) -> Option<Value> {
    let mut map = serde_json::Map::new();
    for pattern in kv_patterns() {
        for caps in pattern.captures_iter(s) {
            let key = caps.name("key")?.as_str().to_string();
            if map.contains_key(&key) {
                continue;
            }
            let raw_val = caps.name("val")?.as_str();
            let value = match raw_val {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => {
                    if let Ok(n) = raw_val.parse::<i64>() {
                        Value::Number(n.into())
                    } else if let Ok(f) = raw_val.parse::<f64>() {
                        serde_json::Number::from_f64(f)
                            .map(Value::Number)
                            .unwrap_or_else(|| Value::String(raw_val.to_string()))
                    } else {
                        Value::String(raw_val.to_string())
                    }
                }
            };
            map.insert(key, value);
        }
    }
    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_parse_of_well_formed_json() {
        let (v, strategy) = safe_parse_json(r#"{"intent":"hi"}"#, Value::Null, "test");
        assert_eq!(strategy, STRATEGY_DIRECT);
        assert_eq!(v["intent"], "hi");
    }

    #[test]
    fn brace_extraction_from_prose_wrapper() {
        let raw = r#"Sure, here is the plan: {"intent":"list files"} — hope that helps!"#;
        let (v, strategy) = safe_parse_json(raw, Value::Null, "test");
        assert_eq!(strategy, STRATEGY_BRACE_EXTRACT);
        assert_eq!(v["intent"], "list files");
    }

    #[test]
    fn markdown_fence_extraction() {
        let raw = "```json\n{\"intent\": \"fenced\"}\n```";
        let (v, strategy) = safe_parse_json(raw, Value::Null, "test");
        assert_eq!(strategy, STRATEGY_MARKDOWN_FENCE);
        assert_eq!(v["intent"], "fenced");
    }

    #[test]
    fn repair_strips_trailing_comma_and_quotes_bare_keys() {
        let raw = r#"{intent: "trailing comma test", needs_memory: true,}"#;
        let (v, strategy) = safe_parse_json(raw, Value::Null, "test");
        assert_eq!(strategy, STRATEGY_REPAIR);
        assert_eq!(v["intent"], "trailing comma test");
        assert_eq!(v["needs_memory"], true);
    }

    #[test]
    fn repair_normalizes_python_literals() {
        let raw = r#"{"is_new_fact": False, "memory_keys": None}"#;
        let (v, strategy) = safe_parse_json(raw, Value::Null, "test");
        assert_eq!(strategy, STRATEGY_REPAIR);
        assert_eq!(v["is_new_fact"], false);
        assert!(v["memory_keys"].is_null());
    }

    #[test]
    fn regex_fallback_on_unparseable_garbage() {
        let raw = r#"intent: "fallback case", confidence: 0.8 and some trailing prose {{{"#;
        let (v, strategy) = safe_parse_json(raw, Value::Null, "test");
        assert_eq!(strategy, STRATEGY_REGEX_KV);
        assert_eq!(v["intent"], "fallback case");
    }

    #[test]
    fn total_failure_returns_default() {
        let default = serde_json::json!({"intent": "fallback"});
        let (v, strategy) = safe_parse_json("   ", default.clone(), "test");
        assert_eq!(strategy, STRATEGY_DEFAULT);
        assert_eq!(v, default);
    }

    #[test]
    fn extract_json_array_direct() {
        let v = extract_json_array(r#"["a","b"]"#, Value::Array(vec![]));
        assert_eq!(v, serde_json::json!(["a", "b"]));
    }

    #[test]
    fn extract_json_array_from_prose() {
        let v = extract_json_array(r#"tools used: ["memory_save", "exec"] in this turn"#, Value::Array(vec![]));
        assert_eq!(v, serde_json::json!(["memory_save", "exec"]));
    }

    #[test]
    fn extract_json_array_comma_fallback() {
        let v = extract_json_array("memory_save, exec, web_search", Value::Array(vec![]));
        assert_eq!(v, serde_json::json!(["memory_save", "exec", "web_search"]));
    }
}

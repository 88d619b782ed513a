//! Cognitive Intent Mapping: a CSV-driven, regex-matched policy table that
//! classifies a user turn into a typed [`CIMDecision`] before Control ever
//! calls a second model. Deterministic and synchronous — no network calls.

use jarvis_domain::cim::{ActionType, CIMDecision, PolicyMatch, PolicyRule, SafetyLevel, SkillScope};
use jarvis_domain::config::CimConfig;
use jarvis_domain::error::{Error, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// The compiled-in policy table, authored from the same column schema the
/// original CIM policy engine loads its CSV from.
const DEFAULT_POLICY_CSV: &str = include_str!("cim_policy.csv");

/// One loaded rule plus its pre-compiled regex (compiling once at startup
/// instead of per-request).
struct CompiledRule {
    rule: PolicyRule,
    regex: Regex,
}

/// Priority ordering used at load time: most dangerous checked first.
fn priority_rank(priority: &str) -> u8 {
    match priority {
        "critical" => 0,
        "high" => 1,
        "normal" => 2,
        "low" => 3,
        _ => 4,
    }
}

pub struct CimPolicyEngine {
    rules: Vec<CompiledRule>,
}

impl CimPolicyEngine {
    /// Load the policy table: the compiled-in CSV by default, or an
    /// external file if [`CimConfig::policy_path`] is set (for iterating on
    /// policy rules without a rebuild).
    pub fn load(config: &CimConfig) -> Result<Self> {
        let csv_text = match &config.policy_path {
            Some(path) => std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("failed to read CIM policy CSV '{path}': {e}")))?,
            None => DEFAULT_POLICY_CSV.to_string(),
        };
        Self::from_csv_str(&csv_text)
    }

    /// Build the engine directly from compiled-in defaults (tests, or a
    /// gateway bootstrap path that never overrides the policy file).
    pub fn with_defaults() -> Result<Self> {
        Self::from_csv_str(DEFAULT_POLICY_CSV)
    }

    fn from_csv_str(csv_text: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().from_reader(csv_text.as_bytes());
        let mut rules = Vec::new();

        for record in reader.deserialize::<CsvRow>() {
            let row = record.map_err(|e| Error::Config(format!("invalid CIM policy row: {e}")))?;
            let rule = row.into_policy_rule()?;
            let regex = Regex::new(&rule.trigger_regex).map_err(|e| {
                Error::Config(format!(
                    "invalid trigger_regex in policy '{}': {e}",
                    rule.pattern_id
                ))
            })?;
            rules.push(CompiledRule { rule, regex });
        }

        rules.sort_by_key(|r| priority_rank(&r.rule.priority));

        Ok(Self { rules })
    }

    /// Classify `user_input` against the policy table. `available_skills`
    /// decides which of `action_if_present`/`action_if_missing` a matched
    /// rule resolves to when `check_skill_exists` is set.
    pub fn process(&self, user_input: &str, available_skills: &[String]) -> CIMDecision {
        let lowered = user_input.to_lowercase();

        for compiled in &self.rules {
            let Some(found) = compiled.regex.find(&lowered) else {
                continue;
            };
            let confidence = match_confidence(found.as_str().len(), lowered.len());
            if confidence < compiled.rule.intent_confidence * 0.8 {
                continue;
            }

            return self.build_decision(compiled, confidence, user_input, available_skills);
        }

        CIMDecision::no_match()
    }

    fn build_decision(
        &self,
        compiled: &CompiledRule,
        confidence: f64,
        user_input: &str,
        available_skills: &[String],
    ) -> CIMDecision {
        let rule = &compiled.rule;
        let derived_skill_name = derive_skill_name(&rule.trigger_category, user_input);

        let exists = rule.check_skill_exists
            && derived_skill_name
                .as_deref()
                .is_some_and(|name| available_skills.iter().any(|s| s == name));

        let action_str = if rule.check_skill_exists {
            if exists {
                &rule.action_if_present
            } else {
                &rule.action_if_missing
            }
        } else {
            &rule.action_if_present
        };

        let mut action = parse_action(action_str);

        // Safety gates: a critical-safety or system-scope rule can never
        // silently auto-create a skill, regardless of what the CSV row
        // otherwise resolves to.
        if action == ActionType::ForceCreateSkill
            && (rule.safety_level == SafetyLevel::Critical || rule.skill_scope == SkillScope::System)
        {
            action = ActionType::DenyAutonomy;
        }

        let fallback_action = parse_action(&rule.fallback_action);

        let policy_match = PolicyMatch {
            pattern_id: rule.pattern_id.clone(),
            trigger_category: rule.trigger_category.clone(),
            confidence,
            action,
            skill_scope: rule.skill_scope,
            safety_level: rule.safety_level,
            requires_confirmation: rule.requires_confirmation,
            allows_chaining: rule.allows_chaining,
            derived_skill_name: derived_skill_name.clone(),
            fallback_action: Some(fallback_action),
        };

        CIMDecision::from_match(
            action,
            derived_skill_name,
            rule.requires_confirmation || action == ActionType::RequestUserConfirmation,
            format!("matched pattern '{}' ({})", rule.pattern_id, rule.trigger_category),
            rule,
            policy_match,
        )
    }
}

/// Confidence heuristic: fraction of the input the matched span covers,
/// capped at 1.0. Longer, more specific matches score higher.
fn match_confidence(match_len: usize, input_len: usize) -> f64 {
    if input_len == 0 {
        return 0.0;
    }
    (match_len as f64 / (input_len as f64 * 0.3)).min(1.0)
}

const MATH_KEYWORDS: &[&str] = &["rechne", "berechne", "calculate", "math", "formel"];
const DATA_KEYWORDS: &[&str] = &["daten", "data", "tabelle", "csv", "analyse"];

/// Derive a deterministic skill name from the user's text: a recognized
/// keyword wins; otherwise fall back to a short content hash so the same
/// request always derives the same name.
fn derive_skill_name(trigger_category: &str, user_input: &str) -> Option<String> {
    let lowered = user_input.to_lowercase();
    let keyword = MATH_KEYWORDS
        .iter()
        .chain(DATA_KEYWORDS.iter())
        .find(|kw| lowered.contains(*kw));

    let raw = match keyword {
        Some(kw) => format!("auto_{trigger_category}_{kw}"),
        None => {
            let mut hasher = Sha256::new();
            hasher.update(user_input.as_bytes());
            let digest = hex::encode(hasher.finalize());
            format!("auto_{trigger_category}_{}", &digest[..6])
        }
    };

    Some(sanitize_skill_name(&raw))
}

fn sanitize_skill_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Parse a CSV action cell into an [`ActionType`]; unrecognized or blank
/// cells fall back to `fallback_chat`, matching the original engine's
/// safe-default behavior rather than panicking on a data typo.
fn parse_action(s: &str) -> ActionType {
    match s.trim() {
        "force_create_skill" => ActionType::ForceCreateSkill,
        "force_run_skill" => ActionType::ForceRunSkill,
        "run_skill" => ActionType::RunSkill,
        "list_skills" => ActionType::ListSkills,
        "web_search" => ActionType::WebSearch,
        "policy_check" => ActionType::PolicyCheck,
        "deny_autonomy" => ActionType::DenyAutonomy,
        "request_user_confirmation" => ActionType::RequestUserConfirmation,
        "retry_once" => ActionType::RetryOnce,
        "mark_skill_unstable" => ActionType::MarkSkillUnstable,
        other => {
            if other != "fallback_chat" && !other.is_empty() {
                tracing::warn!(action = %other, "unrecognized CIM action, falling back to fallback_chat");
            }
            ActionType::FallbackChat
        }
    }
}

/// Raw CSV row shape; deserialized by column name, then validated/converted
/// into the typed [`PolicyRule`] domain type.
#[derive(Debug, serde::Deserialize)]
struct CsvRow {
    pattern_id: String,
    trigger_category: String,
    trigger_regex: String,
    priority: String,
    intent_confidence: f64,
    safety_level: String,
    skill_scope: String,
    check_skill_exists: bool,
    action_if_present: String,
    action_if_missing: String,
    fallback_action: String,
    requires_confirmation: bool,
    allows_chaining: bool,
}

impl CsvRow {
    fn into_policy_rule(self) -> Result<PolicyRule> {
        let safety_level = match self.safety_level.as_str() {
            "low" => SafetyLevel::Low,
            "medium" => SafetyLevel::Medium,
            "high" => SafetyLevel::High,
            "critical" => SafetyLevel::Critical,
            other => {
                return Err(Error::Config(format!(
                    "policy '{}': unknown safety_level '{other}'",
                    self.pattern_id
                )))
            }
        };
        let skill_scope = match self.skill_scope.as_str() {
            "stateless" => SkillScope::Stateless,
            "session" => SkillScope::Session,
            "persistent" => SkillScope::Persistent,
            "system" => SkillScope::System,
            other => {
                return Err(Error::Config(format!(
                    "policy '{}': unknown skill_scope '{other}'",
                    self.pattern_id
                )))
            }
        };

        Ok(PolicyRule {
            pattern_id: self.pattern_id,
            trigger_category: self.trigger_category,
            trigger_regex: self.trigger_regex,
            priority: self.priority,
            intent_confidence: self.intent_confidence,
            safety_level,
            skill_scope,
            check_skill_exists: self.check_skill_exists,
            action_if_present: self.action_if_present,
            action_if_missing: self.action_if_missing,
            fallback_action: self.fallback_action,
            requires_confirmation: self.requires_confirmation,
            allows_chaining: self.allows_chaining,
        })
    }
}

/// Count of rules per safety level, used by `doctor`-style diagnostics to
/// confirm the policy table loaded with a sane critical/high mix.
pub fn safety_level_histogram(engine: &CimPolicyEngine) -> HashMap<&'static str, usize> {
    let mut hist = HashMap::new();
    for compiled in &engine.rules {
        let key = match compiled.rule.safety_level {
            SafetyLevel::Low => "low",
            SafetyLevel::Medium => "medium",
            SafetyLevel::High => "high",
            SafetyLevel::Critical => "critical",
        };
        *hist.entry(key).or_insert(0) += 1;
    }
    hist
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_default_table_sorted_by_priority() {
        let engine = CimPolicyEngine::with_defaults().unwrap();
        assert!(!engine.rules.is_empty());
        let ranks: Vec<u8> = engine
            .rules
            .iter()
            .map(|r| priority_rank(&r.rule.priority))
            .collect();
        let mut sorted = ranks.clone();
        sorted.sort();
        assert_eq!(ranks, sorted);
    }

    #[test]
    fn destructive_fs_request_is_denied() {
        let engine = CimPolicyEngine::with_defaults().unwrap();
        let decision = engine.process("bitte l\u{f6}sche alles auf der platte", &[]);
        assert!(decision.matched);
        assert_eq!(decision.action, ActionType::DenyAutonomy);
        assert!(decision.requires_confirmation);
    }

    #[test]
    fn system_skill_creation_always_requires_confirmation_not_auto_create() {
        let engine = CimPolicyEngine::with_defaults().unwrap();
        let decision = engine.process("create a system skill for me please", &[]);
        assert!(decision.matched);
        assert_ne!(decision.action, ActionType::ForceCreateSkill);
    }

    #[test]
    fn generic_skill_creation_creates_when_missing() {
        let engine = CimPolicyEngine::with_defaults().unwrap();
        let decision = engine.process("erstelle eine neue skill für mich", &[]);
        assert!(decision.matched);
        assert_eq!(decision.action, ActionType::ForceCreateSkill);
        assert!(decision.requires_confirmation);
    }

    #[test]
    fn unrelated_chit_chat_does_not_match() {
        let engine = CimPolicyEngine::with_defaults().unwrap();
        let decision = engine.process("wie geht es dir heute?", &[]);
        assert!(!decision.matched);
        assert_eq!(decision.action, ActionType::FallbackChat);
    }

    #[test]
    fn web_search_request_matches_low_safety() {
        let engine = CimPolicyEngine::with_defaults().unwrap();
        let decision = engine.process("suche im internet nach rust async traits", &[]);
        assert!(decision.matched);
        assert_eq!(decision.action, ActionType::WebSearch);
        assert!(!decision.requires_confirmation);
    }

    #[test]
    fn derive_skill_name_uses_known_keyword() {
        let name = derive_skill_name("skill_creation", "bitte berechne die summe").unwrap();
        assert_eq!(name, "auto_skill_creation_berechne");
    }

    #[test]
    fn derive_skill_name_falls_back_to_hash() {
        let name = derive_skill_name("skill_creation", "xyz qux zzy").unwrap();
        assert!(name.starts_with("auto_skill_creation_"));
        assert_eq!(name.len(), "auto_skill_creation_".len() + 6);
    }

    #[test]
    fn parse_action_unknown_falls_back_to_fallback_chat() {
        assert_eq!(parse_action("totally_bogus"), ActionType::FallbackChat);
    }
}

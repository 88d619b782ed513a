use serde::{Deserialize, Serialize};

/// How dangerous a matched policy's action is judged to be. `Critical`
/// policies can never auto-create a skill, only confirm or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Lifetime/visibility scope of a skill a policy rule targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillScope {
    Stateless,
    Session,
    Persistent,
    System,
}

/// The concrete action a matched policy resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ForceCreateSkill,
    ForceRunSkill,
    RunSkill,
    ListSkills,
    WebSearch,
    PolicyCheck,
    DenyAutonomy,
    RequestUserConfirmation,
    FallbackChat,
    RetryOnce,
    MarkSkillUnstable,
}

/// One row of the compiled-in policy table, ordered by priority
/// (`critical` < `high` < `normal` < `low` in sort order, i.e. most
/// dangerous checked first).
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub pattern_id: String,
    pub trigger_category: String,
    pub trigger_regex: String,
    pub priority: String,
    pub intent_confidence: f64,
    pub safety_level: SafetyLevel,
    pub skill_scope: SkillScope,
    pub check_skill_exists: bool,
    pub action_if_present: String,
    pub action_if_missing: String,
    pub fallback_action: String,
    pub requires_confirmation: bool,
    pub allows_chaining: bool,
}

/// Details of the policy rule a request matched, carried alongside the
/// final decision for audit logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyMatch {
    pub pattern_id: String,
    pub trigger_category: String,
    pub confidence: f64,
    pub action: ActionType,
    pub skill_scope: SkillScope,
    pub safety_level: SafetyLevel,
    pub requires_confirmation: bool,
    pub allows_chaining: bool,
    pub derived_skill_name: Option<String>,
    pub fallback_action: Option<ActionType>,
}

/// The final decision produced by the policy engine for a single request.
/// `requires_confirmation` and `allows_chaining` are independent gates: a
/// decision can require confirmation and still permit chaining once granted.
///
/// `safety_level`, `skill_scope`, `allows_chaining`, `check_skill_exists`, and
/// `intent_confidence` are copied up from the matched [`PolicyMatch`]/
/// [`PolicyRule`] (defaulting to the lowest-trust values when nothing
/// matched) so callers can read them without unwrapping `policy_match`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CIMDecision {
    pub matched: bool,
    pub action: ActionType,
    pub skill_name: Option<String>,
    #[serde(default)]
    pub requires_confirmation: bool,
    pub policy_match: Option<PolicyMatch>,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "SafetyLevel::default_low")]
    pub safety_level: SafetyLevel,
    #[serde(default = "SkillScope::default_stateless")]
    pub skill_scope: SkillScope,
    #[serde(default)]
    pub allows_chaining: bool,
    #[serde(default)]
    pub check_skill_exists: bool,
    #[serde(default)]
    pub intent_confidence: f64,
}

impl SafetyLevel {
    fn default_low() -> Self {
        SafetyLevel::Low
    }
}

impl SkillScope {
    fn default_stateless() -> Self {
        SkillScope::Stateless
    }
}

impl CIMDecision {
    /// Decision for input that matched no policy pattern: falls through to
    /// ordinary chat, no tool access implied.
    pub fn no_match() -> Self {
        Self {
            matched: false,
            action: ActionType::FallbackChat,
            skill_name: None,
            requires_confirmation: false,
            policy_match: None,
            reason: "no policy pattern matched".into(),
            safety_level: SafetyLevel::Low,
            skill_scope: SkillScope::Stateless,
            allows_chaining: false,
            check_skill_exists: false,
            intent_confidence: 0.0,
        }
    }

    /// Build a decision from a matched policy rule and its derived
    /// [`PolicyMatch`], surfacing the rule's safety metadata directly.
    pub fn from_match(
        action: ActionType,
        skill_name: Option<String>,
        requires_confirmation: bool,
        reason: String,
        rule: &PolicyRule,
        policy_match: PolicyMatch,
    ) -> Self {
        Self {
            matched: true,
            action,
            skill_name,
            requires_confirmation,
            safety_level: rule.safety_level,
            skill_scope: rule.skill_scope,
            allows_chaining: rule.allows_chaining,
            check_skill_exists: rule.check_skill_exists,
            intent_confidence: rule.intent_confidence,
            policy_match: Some(policy_match),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_level_orders_low_to_critical() {
        assert!(SafetyLevel::Low < SafetyLevel::Critical);
        assert!(SafetyLevel::High < SafetyLevel::Critical);
    }

    #[test]
    fn no_match_is_not_matched() {
        let decision = CIMDecision::no_match();
        assert!(!decision.matched);
        assert_eq!(decision.action, ActionType::FallbackChat);
    }
}

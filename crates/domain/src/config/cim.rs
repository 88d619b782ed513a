use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CIM policy engine configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where the policy engine loads its CSV rule table from. Defaults to the
/// compiled-in asset; set `path` to override with a file on disk (used for
/// hot-iterating on policy rules without a rebuild).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CimConfig {
    /// Path to an external `cim_policy.csv` to load instead of the
    /// compiled-in default. `None` uses the built-in table.
    #[serde(default)]
    pub policy_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_compiled_in_table() {
        assert!(CimConfig::default().policy_path.is_none());
    }
}

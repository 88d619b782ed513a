use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task lifecycle configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Settings for the SQLite-backed task lifecycle store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLifecycleConfig {
    /// Per-conversation cap on the `active` table. Oldest (by `last_updated`)
    /// rows beyond this are evicted to `archive` on insert.
    #[serde(default = "default_active_limit")]
    pub active_limit: usize,

    /// Hours an active task may sit untouched before a reconciliation pass
    /// archives it regardless of the active-table cap.
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: u64,

    /// Path to the SQLite database file. Resolved from `MEMORY_DB_PATH` or
    /// `JARVIS_DB_PATH` at load time if left as the default.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for TaskLifecycleConfig {
    fn default() -> Self {
        Self {
            active_limit: default_active_limit(),
            expiry_hours: default_expiry_hours(),
            db_path: default_db_path(),
        }
    }
}

impl TaskLifecycleConfig {
    /// Clamp `active_limit` to a sane range; a cap of 0 would evict every
    /// insert immediately, and very large caps defeat the point of the cap.
    pub fn clamped(&self) -> Self {
        Self {
            active_limit: self.active_limit.clamp(1, 1000),
            expiry_hours: self.expiry_hours,
            db_path: self.db_path.clone(),
        }
    }
}

fn default_active_limit() -> usize {
    10
}

fn default_expiry_hours() -> u64 {
    48
}

fn default_db_path() -> String {
    std::env::var("MEMORY_DB_PATH")
        .or_else(|_| std::env::var("JARVIS_DB_PATH"))
        .unwrap_or_else(|_| "jarvis.db".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_active_limit_is_ten() {
        assert_eq!(TaskLifecycleConfig::default().active_limit, 10);
    }

    #[test]
    fn default_expiry_hours_is_48() {
        assert_eq!(TaskLifecycleConfig::default().expiry_hours, 48);
    }

    #[test]
    fn clamp_below_min() {
        let cfg = TaskLifecycleConfig {
            active_limit: 0,
            ..TaskLifecycleConfig::default()
        };
        assert_eq!(cfg.clamped().active_limit, 1);
    }

    #[test]
    fn clamp_above_max() {
        let cfg = TaskLifecycleConfig {
            active_limit: 10_000,
            ..TaskLifecycleConfig::default()
        };
        assert_eq!(cfg.clamped().active_limit, 1000);
    }

    #[test]
    fn deserialize_missing_fields_uses_defaults() {
        let cfg: TaskLifecycleConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.active_limit, 10);
        assert_eq!(cfg.expiry_hours, 48);
    }
}

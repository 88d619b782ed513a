//! Graph hygiene: SQLite is truth, the semantic graph is just an index.
//!
//! Deterministic pipeline — parse, extra-filter, dedupe to the latest
//! revision per id, then cross-check against the SQLite active set.
//! Fails closed: if the active-id lookup errors, candidates are dropped
//! rather than served stale.
//!
//! A reconciliation job walks a node store behind [`GraphNodeStore`] and
//! deletes stale nodes (tombstoned, or absent from the active set), in
//! dry-run or apply mode.

use std::collections::HashSet;

use jarvis_domain::error::Result;
use serde_json::Value;

/// One blueprint/skill candidate pulled from a semantic graph search,
/// parsed into a shape the hygiene pipeline can reason about.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphCandidate {
    pub blueprint_id: String,
    pub score: f64,
    pub meta: Value,
    pub content: String,
    pub updated_at: String,
    pub node_id: i64,
}

/// Per-step counts for the `graph_candidates_*` log markers, plus the
/// effective crosscheck mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HygieneReport {
    pub graph_candidates_raw: usize,
    pub graph_candidates_after_extra: usize,
    pub graph_candidates_deduped: usize,
    pub graph_candidates_after_sqlite_filter: usize,
    pub graph_crosscheck_mode: String,
}

/// Parse one raw search-result object into a [`GraphCandidate`].
/// Returns `None` if metadata is unparseable or no `blueprint_id` can be
/// determined (from metadata, or the `"id: ..."` content-prefix fallback).
fn parse_candidate(raw: &Value) -> Option<GraphCandidate> {
    let meta = match raw.get("metadata") {
        Some(Value::String(s)) => serde_json::from_str::<Value>(s).ok()?,
        Some(v @ Value::Object(_)) => v.clone(),
        _ => Value::Object(Default::default()),
    };
    let meta = if meta.is_object() { meta } else { Value::Object(Default::default()) };

    let content = raw.get("content").and_then(Value::as_str).unwrap_or("").to_string();

    let blueprint_id = meta
        .get("blueprint_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| content.split_once(':').map(|(prefix, _)| prefix.trim().to_string()))
        .filter(|s| !s.is_empty())?;

    let score = raw
        .get("similarity")
        .or_else(|| raw.get("score"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let node_id = raw
        .get("id")
        .or_else(|| raw.get("node_id"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let updated_at = meta.get("updated_at").and_then(Value::as_str).unwrap_or("").to_string();

    Some(GraphCandidate {
        blueprint_id,
        score,
        meta,
        content,
        updated_at,
        node_id,
    })
}

/// Keep exactly one candidate per `blueprint_id` — the one with the highest
/// `(updated_at, node_id)` tuple, lexicographic on `updated_at` (ISO 8601
/// sorts correctly this way; `""` loses to any real timestamp). Result is
/// sorted by score descending.
pub fn dedupe_latest_by_blueprint_id(candidates: Vec<GraphCandidate>) -> Vec<GraphCandidate> {
    use std::collections::HashMap;
    let mut best: HashMap<String, GraphCandidate> = HashMap::new();
    for c in candidates {
        match best.get(&c.blueprint_id) {
            None => {
                best.insert(c.blueprint_id.clone(), c);
            }
            Some(existing) => {
                if (&c.updated_at, c.node_id) > (&existing.updated_at, existing.node_id) {
                    best.insert(c.blueprint_id.clone(), c);
                }
            }
        }
    }
    let mut out: Vec<GraphCandidate> = best.into_values().collect();
    out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// Filter candidates to only those present in `active_ids`. When
/// `fail_closed` is false, every candidate passes unfiltered (legacy
/// opt-in only — callers should default to `true`).
pub fn filter_against_sqlite_active_set(
    candidates: Vec<GraphCandidate>,
    active_ids: &HashSet<String>,
    fail_closed: bool,
) -> Vec<GraphCandidate> {
    if !fail_closed {
        tracing::warn!("graph hygiene crosscheck running fail-open");
        return candidates;
    }
    candidates
        .into_iter()
        .filter(|c| {
            let keep = active_ids.contains(&c.blueprint_id);
            if !keep {
                tracing::info!(
                    blueprint_id = %c.blueprint_id,
                    "rejected candidate not in SQLite active set"
                );
            }
            keep
        })
        .collect()
}

/// Full pipeline: parse → extra filter → dedupe-latest → SQLite crosscheck.
///
/// `load_active_ids` is called at most once, lazily, only if any candidate
/// survives dedupe — it's the caller's job to query whatever SQLite table
/// backs the entity kind being hygiened (blueprints, skills, ...). On
/// failure the pipeline fails closed (empty result) unless `fail_closed` is
/// false, in which case the deduped set passes through unfiltered.
pub fn apply_graph_hygiene(
    raw_results: &[Value],
    extra_filter: Option<&dyn Fn(&GraphCandidate) -> bool>,
    fail_closed: bool,
    load_active_ids: impl FnOnce() -> Result<HashSet<String>>,
) -> (Vec<GraphCandidate>, HygieneReport) {
    let parsed: Vec<GraphCandidate> = raw_results.iter().filter_map(parse_candidate).collect();
    let raw_count = parsed.len();

    let filtered = match extra_filter {
        Some(pred) => parsed.into_iter().filter(|c| pred(c)).collect(),
        None => parsed,
    };
    let after_extra = filtered.len();

    let deduped = dedupe_latest_by_blueprint_id(filtered);
    let deduped_count = deduped.len();

    let (final_candidates, mode) = if deduped.is_empty() {
        (deduped, "strict".to_string())
    } else {
        match load_active_ids() {
            Ok(active_ids) => {
                let final_candidates = filter_against_sqlite_active_set(deduped, &active_ids, fail_closed);
                (final_candidates, "strict".to_string())
            }
            Err(e) => {
                tracing::warn!(error = %e, "graph hygiene SQLite crosscheck failed");
                if fail_closed {
                    tracing::warn!("fail_closed=true — returning no candidates");
                    (Vec::new(), "fail_closed_no_sqlite".to_string())
                } else {
                    tracing::warn!("fail_closed=false — returning deduped candidates unfiltered");
                    (deduped, "fail_open_no_sqlite".to_string())
                }
            }
        }
    };

    let report = HygieneReport {
        graph_candidates_raw: raw_count,
        graph_candidates_after_extra: after_extra,
        graph_candidates_deduped: deduped_count,
        graph_candidates_after_sqlite_filter: final_candidates.len(),
        graph_crosscheck_mode: mode,
    };
    tracing::info!(
        raw = report.graph_candidates_raw,
        after_extra = report.graph_candidates_after_extra,
        deduped = report.graph_candidates_deduped,
        final_count = report.graph_candidates_after_sqlite_filter,
        mode = %report.graph_crosscheck_mode,
        "graph hygiene pipeline complete"
    );

    (final_candidates, report)
}

// ── Reconciliation job ──────────────────────────────────────────────

/// One node as seen by whatever store backs the semantic graph index.
pub struct GraphNode {
    pub node_id: i64,
    pub content: String,
    pub metadata: Value,
}

/// Abstracts over the secondary graph index the reconciliation job walks.
/// Kept as a trait rather than a hardcoded SQLite table because this crate
/// doesn't own that schema — it belongs to whichever memory/index backend
/// the Hub wires in.
pub trait GraphNodeStore: Send + Sync {
    fn list_nodes(&self, conversation_id: &str) -> Result<Vec<GraphNode>>;
    fn delete_nodes(&self, node_ids: &[i64]) -> Result<usize>;
}

pub struct StaleNode {
    pub node_id: i64,
    pub blueprint_id: String,
    pub reason: String,
}

pub struct ReconcileReport {
    pub active_in_sqlite: usize,
    pub graph_nodes_total: usize,
    pub stale: Vec<StaleNode>,
    pub removed: usize,
    pub dry_run: bool,
}

fn derive_blueprint_id(node: &GraphNode) -> String {
    node.metadata
        .get("blueprint_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| node.content.split_once(':').map(|(prefix, _)| prefix.trim().to_string()))
        .unwrap_or_default()
}

/// Walk every node in `conversation_id` (conventionally `_blueprints`),
/// identify stale ones (tombstoned via `metadata.is_deleted`, unparseable,
/// or absent from `active_ids`), and delete them when `apply` is true.
/// Dry-run (the default in callers) only reports what would be removed.
pub fn reconcile_graph_nodes(
    store: &dyn GraphNodeStore,
    active_ids: &HashSet<String>,
    conversation_id: &str,
    apply: bool,
) -> Result<ReconcileReport> {
    let nodes = store.list_nodes(conversation_id)?;
    let graph_nodes_total = nodes.len();

    let mut stale = Vec::new();
    for node in &nodes {
        let blueprint_id = derive_blueprint_id(node);
        let reason = if node.metadata.get("is_deleted").and_then(Value::as_bool).unwrap_or(false) {
            Some("tombstoned (is_deleted=true in metadata)".to_string())
        } else if blueprint_id.is_empty() {
            Some("no blueprint_id (unparseable node)".to_string())
        } else if !active_ids.contains(&blueprint_id) {
            Some(format!("soft-deleted or stale ('{blueprint_id}' not in SQLite active set)"))
        } else {
            None
        };

        if let Some(reason) = reason {
            stale.push(StaleNode {
                node_id: node.node_id,
                blueprint_id,
                reason,
            });
        }
    }

    let removed = if apply && !stale.is_empty() {
        let node_ids: Vec<i64> = stale.iter().map(|s| s.node_id).collect();
        store.delete_nodes(&node_ids)?
    } else {
        0
    };

    tracing::info!(
        active_in_sqlite = active_ids.len(),
        graph_nodes_total,
        stale_count = stale.len(),
        removed,
        dry_run = !apply,
        "graph reconciliation complete"
    );

    Ok(ReconcileReport {
        active_in_sqlite: active_ids.len(),
        graph_nodes_total,
        stale,
        removed,
        dry_run: !apply,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn parse_candidate_reads_blueprint_id_from_metadata() {
        let raw = json!({
            "content": "irrelevant",
            "metadata": {"blueprint_id": "bp-1", "updated_at": "2026-01-01T00:00:00Z"},
            "similarity": 0.9,
            "id": 5,
        });
        let c = parse_candidate(&raw).unwrap();
        assert_eq!(c.blueprint_id, "bp-1");
        assert_eq!(c.node_id, 5);
    }

    #[test]
    fn parse_candidate_falls_back_to_content_prefix() {
        let raw = json!({"content": "bp-2: some description", "metadata": {}});
        let c = parse_candidate(&raw).unwrap();
        assert_eq!(c.blueprint_id, "bp-2");
    }

    #[test]
    fn parse_candidate_drops_when_no_blueprint_id_available() {
        let raw = json!({"content": "no colon here", "metadata": {}});
        assert!(parse_candidate(&raw).is_none());
    }

    #[test]
    fn dedupe_keeps_latest_updated_at() {
        let older = GraphCandidate {
            blueprint_id: "bp".into(),
            score: 0.5,
            meta: json!({}),
            content: String::new(),
            updated_at: "2026-01-01T00:00:00Z".into(),
            node_id: 1,
        };
        let newer = GraphCandidate {
            updated_at: "2026-02-01T00:00:00Z".into(),
            node_id: 2,
            score: 0.1,
            ..older.clone()
        };
        let result = dedupe_latest_by_blueprint_id(vec![older, newer.clone()]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].updated_at, newer.updated_at);
    }

    #[test]
    fn filter_fail_closed_drops_ids_not_active() {
        let c = GraphCandidate {
            blueprint_id: "bp-1".into(),
            score: 1.0,
            meta: json!({}),
            content: String::new(),
            updated_at: String::new(),
            node_id: 0,
        };
        let active: HashSet<String> = HashSet::new();
        let result = filter_against_sqlite_active_set(vec![c], &active, true);
        assert!(result.is_empty());
    }

    #[test]
    fn apply_graph_hygiene_fails_closed_on_sqlite_error() {
        let raw = vec![json!({"content": "bp-1: x", "metadata": {}})];
        let (candidates, report) =
            apply_graph_hygiene(&raw, None, true, || Err(jarvis_domain::error::Error::Other("db down".into())));
        assert!(candidates.is_empty());
        assert_eq!(report.graph_crosscheck_mode, "fail_closed_no_sqlite");
    }

    #[test]
    fn apply_graph_hygiene_keeps_candidates_in_active_set() {
        let raw = vec![json!({"content": "bp-1: x", "metadata": {}})];
        let mut active = HashSet::new();
        active.insert("bp-1".to_string());
        let (candidates, report) = apply_graph_hygiene(&raw, None, true, || Ok(active));
        assert_eq!(candidates.len(), 1);
        assert_eq!(report.graph_candidates_after_sqlite_filter, 1);
    }

    struct FakeStore {
        nodes: Vec<GraphNode>,
        deleted: Mutex<Vec<i64>>,
    }
    impl GraphNodeStore for FakeStore {
        fn list_nodes(&self, _conversation_id: &str) -> Result<Vec<GraphNode>> {
            Ok(self
                .nodes
                .iter()
                .map(|n| GraphNode {
                    node_id: n.node_id,
                    content: n.content.clone(),
                    metadata: n.metadata.clone(),
                })
                .collect())
        }
        fn delete_nodes(&self, node_ids: &[i64]) -> Result<usize> {
            self.deleted.lock().unwrap().extend_from_slice(node_ids);
            Ok(node_ids.len())
        }
    }

    #[test]
    fn reconcile_dry_run_reports_without_deleting() {
        let store = FakeStore {
            nodes: vec![
                GraphNode { node_id: 1, content: "bp-1: ok".into(), metadata: json!({}) },
                GraphNode { node_id: 2, content: "bp-2: gone".into(), metadata: json!({}) },
            ],
            deleted: Mutex::new(Vec::new()),
        };
        let mut active = HashSet::new();
        active.insert("bp-1".to_string());

        let report = reconcile_graph_nodes(&store, &active, "_blueprints", false).unwrap();
        assert_eq!(report.stale.len(), 1);
        assert_eq!(report.stale[0].blueprint_id, "bp-2");
        assert_eq!(report.removed, 0);
        assert!(store.deleted.lock().unwrap().is_empty());
    }

    #[test]
    fn reconcile_apply_deletes_stale_nodes() {
        let store = FakeStore {
            nodes: vec![GraphNode {
                node_id: 9,
                content: String::new(),
                metadata: json!({"is_deleted": true}),
            }],
            deleted: Mutex::new(Vec::new()),
        };
        let active = HashSet::new();
        let report = reconcile_graph_nodes(&store, &active, "_blueprints", true).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(*store.deleted.lock().unwrap(), vec![9]);
    }
}

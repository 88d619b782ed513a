//! `jarvis-tasks` — SQLite-backed task lifecycle and graph hygiene.
//!
//! [`lifecycle::TaskLifecycleManager`] implements
//! [`jarvis_orchestrator::TaskSink`] so the orchestrator can submit
//! start/finish events without knowing how they're persisted.
//! [`graph_hygiene`] is a pure pipeline used wherever a secondary semantic
//! index needs cross-checking against SQLite as the source of truth.

pub mod graph_hygiene;
pub mod lifecycle;

pub use lifecycle::TaskLifecycleManager;

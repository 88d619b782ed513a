//! Task lifecycle manager: active-task tracking with automatic eviction and
//! archival, backed by SQLite.
//!
//! `task_active` holds at most [`TaskLifecycleManager::active_limit`] rows
//! per conversation; `finish_task` recomputes an importance score and
//! triggers [`TaskLifecycleManager::check_and_flush`], which moves rows
//! older than the TTL or beyond the active cap into `task_archive` inside a
//! single `BEGIN IMMEDIATE` transaction. Every call opens its own
//! connection and runs on `spawn_blocking`, the usual pattern for wrapping
//! a blocking resource in an async pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::{json, Value};

use jarvis_domain::error::{Error, Result};
use jarvis_orchestrator::TaskSink;

const ACTIVE_LIMIT: i64 = 10;
const EXPIRY_HOURS: i64 = 48;

pub struct ActiveTask {
    pub task_id: String,
    pub conversation_id: String,
    pub content: Value,
    pub created_at: String,
    pub last_updated: String,
    pub importance: f64,
}

pub struct TaskLifecycleManager {
    db_path: PathBuf,
    active_limit: i64,
    ttl_hours: i64,
    timers: Mutex<HashMap<String, Instant>>,
}

impl TaskLifecycleManager {
    /// Opens (creating if absent) the SQLite database at `db_path` and runs
    /// the `task_active`/`task_archive` migration. Runs synchronously at
    /// construction time.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        let conn = open_conn(&db_path)?;
        migrate(&conn)?;
        tracing::info!(db_path = %db_path.display(), "task lifecycle manager initialized");
        Ok(Self {
            db_path,
            active_limit: ACTIVE_LIMIT,
            ttl_hours: EXPIRY_HOURS,
            timers: Mutex::new(HashMap::new()),
        })
    }

    pub async fn get_active_context(&self, conversation_id: Option<&str>) -> Result<Vec<ActiveTask>> {
        let db_path = self.db_path.clone();
        let conversation_id = conversation_id.map(str::to_string);
        let limit = self.active_limit;
        tokio::task::spawn_blocking(move || -> Result<Vec<ActiveTask>> {
            let conn = open_conn(&db_path)?;
            let rows = if let Some(cid) = &conversation_id {
                let mut stmt = conn.prepare(
                    "SELECT task_id, conversation_id, content, created_at, last_updated, importance_score \
                     FROM task_active WHERE conversation_id = ?1 ORDER BY last_updated DESC",
                )?;
                let rows = stmt
                    .query_map(params![cid], row_to_active_task)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            } else {
                let mut stmt = conn.prepare(
                    "SELECT task_id, conversation_id, content, created_at, last_updated, importance_score \
                     FROM task_active ORDER BY last_updated DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], row_to_active_task)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            Ok(rows)
        })
        .await
        .map_err(|e| Error::Other(format!("join error: {e}")))?
    }

    pub async fn get_active_count(&self, conversation_id: &str) -> Result<i64> {
        let db_path = self.db_path.clone();
        let conversation_id = conversation_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<i64> {
            let conn = open_conn(&db_path)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM task_active WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
        .map_err(|e| Error::Other(format!("join error: {e}")))?
    }

    /// Move rows past the TTL, then any overflow beyond `active_limit`, from
    /// active into archive, atomically under `BEGIN IMMEDIATE`.
    pub async fn check_and_flush(&self, conversation_id: &str) -> Result<()> {
        let db_path = self.db_path.clone();
        let conversation_id = conversation_id.to_string();
        let active_limit = self.active_limit;
        let ttl_hours = self.ttl_hours;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = open_conn(&db_path)?;
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

            let expiry_cutoff = (Utc::now() - chrono::Duration::hours(ttl_hours)).to_rfc3339();
            let expired = {
                let mut stmt = tx.prepare(
                    "SELECT task_id, conversation_id, content FROM task_active \
                     WHERE conversation_id = ?1 AND created_at < ?2",
                )?;
                stmt.query_map(params![conversation_id, expiry_cutoff], row_to_archive_move)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            for row in &expired {
                move_to_archive(&tx, row)?;
            }
            if !expired.is_empty() {
                tracing::info!(count = expired.len(), conversation_id, "expired stale tasks");
            }

            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM task_active WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )?;
            if count > active_limit {
                let overflow = {
                    let mut stmt = tx.prepare(
                        "SELECT task_id, conversation_id, content FROM task_active \
                         WHERE conversation_id = ?1 ORDER BY last_updated DESC LIMIT -1 OFFSET ?2",
                    )?;
                    stmt.query_map(params![conversation_id, active_limit], row_to_archive_move)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                };
                for row in &overflow {
                    move_to_archive(&tx, row)?;
                }
                tracing::info!(
                    evicted = overflow.len(),
                    was = count,
                    now = active_limit,
                    conversation_id,
                    "flushed overflow tasks"
                );
            }

            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Other(format!("join error: {e}")))?
    }
}

#[async_trait]
impl TaskSink for TaskLifecycleManager {
    async fn start_task(&self, request_id: &str, conversation_id: &str, user_text: &str) {
        self.timers
            .lock()
            .unwrap()
            .insert(request_id.to_string(), Instant::now());

        let task_id = format!("task_{request_id}");
        let now = Utc::now().to_rfc3339();
        let content = json!({
            "status": "running",
            "summary": truncate(user_text, 200),
            "context": {
                "user_text": truncate(user_text, 500),
                "request_id": request_id,
            },
            "result": Value::Null,
        });

        let db_path = self.db_path.clone();
        let conversation_id = conversation_id.to_string();
        let result = tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_conn(&db_path)?;
            conn.execute(
                "INSERT OR REPLACE INTO task_active \
                 (conversation_id, task_id, content, created_at, last_updated, importance_score) \
                 VALUES (?1, ?2, ?3, ?4, ?4, 0.0)",
                params![conversation_id, task_id, content.to_string(), now],
            )?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => tracing::info!(request_id, "task started"),
            Ok(Err(e)) => tracing::error!(request_id, error = %e, "failed to persist start_task"),
            Err(e) => tracing::error!(request_id, error = %e, "start_task join error"),
        }
    }

    async fn finish_task(&self, request_id: &str, result: Option<&str>, error: Option<&str>) {
        let duration = self
            .timers
            .lock()
            .unwrap()
            .remove(request_id)
            .map(|start| start.elapsed())
            .unwrap_or_default();

        let task_id = format!("task_{request_id}");
        let status = if error.is_some() { "failed" } else { "completed" };
        let result = result.map(str::to_string);
        let error = error.map(str::to_string);
        let db_path = self.db_path.clone();
        let this_request_id = request_id.to_string();

        let flush_target = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = open_conn(&db_path)?;
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT content, conversation_id FROM task_active WHERE task_id = ?1",
                    params![task_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .ok();

            let Some((content_raw, conversation_id)) = row else {
                tracing::warn!(task_id, "task not found in active table");
                return Ok(None);
            };

            let mut content: Value = serde_json::from_str(&content_raw)?;
            content["status"] = json!(status);
            content["result"] = json!(result);
            content["duration_s"] = json!((duration.as_secs_f64() * 100.0).round() / 100.0);
            if let Some(e) = &error {
                content["error"] = json!(e);
            }

            let importance = calculate_importance(&content, duration);
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE task_active SET content = ?1, last_updated = ?2, importance_score = ?3 \
                 WHERE task_id = ?4",
                params![content.to_string(), now, importance, task_id],
            )?;
            tracing::info!(
                task_id,
                duration_s = duration.as_secs_f64(),
                status,
                importance,
                "task finished"
            );
            Ok(Some(conversation_id))
        })
        .await;

        match flush_target {
            Ok(Ok(Some(conversation_id))) => {
                if let Err(e) = self.check_and_flush(&conversation_id).await {
                    tracing::error!(request_id = this_request_id, error = %e, "flush after finish_task failed");
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => tracing::error!(request_id = this_request_id, error = %e, "failed to persist finish_task"),
            Err(e) => tracing::error!(request_id = this_request_id, error = %e, "finish_task join error"),
        }
    }
}

fn open_conn(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(Duration::from_millis(5_000))?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS task_active (
            conversation_id TEXT NOT NULL,
            task_id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            importance_score REAL NOT NULL DEFAULT 0.0
         );
         CREATE INDEX IF NOT EXISTS idx_task_active_conversation ON task_active(conversation_id);
         CREATE TABLE IF NOT EXISTS task_archive (
            conversation_id TEXT NOT NULL,
            task_id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            archived_at TEXT NOT NULL,
            embedding_id TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_task_archive_embedding ON task_archive(embedding_id);",
    )?;
    Ok(())
}

struct ArchiveMove {
    task_id: String,
    conversation_id: String,
    content: String,
}

fn row_to_archive_move(row: &rusqlite::Row) -> rusqlite::Result<ArchiveMove> {
    Ok(ArchiveMove {
        task_id: row.get(0)?,
        conversation_id: row.get(1)?,
        content: row.get(2)?,
    })
}

fn row_to_active_task(row: &rusqlite::Row) -> rusqlite::Result<ActiveTask> {
    let content_raw: String = row.get(2)?;
    Ok(ActiveTask {
        task_id: row.get(0)?,
        conversation_id: row.get(1)?,
        content: serde_json::from_str(&content_raw).unwrap_or(Value::Null),
        created_at: row.get(3)?,
        last_updated: row.get(4)?,
        importance: row.get(5)?,
    })
}

/// Moves one row from active to archive within the caller's transaction.
/// Per-row failures are logged and skipped rather than aborting the whole
/// flush.
fn move_to_archive(tx: &rusqlite::Transaction, task: &ArchiveMove) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    tx.execute(
        "INSERT OR REPLACE INTO task_archive (conversation_id, task_id, content, archived_at, embedding_id) \
         VALUES (?1, ?2, ?3, ?4, NULL)",
        params![task.conversation_id, task.task_id, task.content, now],
    )?;
    tx.execute("DELETE FROM task_active WHERE task_id = ?1", params![task.task_id])?;
    Ok(())
}

/// Importance heuristic used for eviction priority: failed tasks, long-
/// running tasks, and tasks that produced a result all score higher.
/// Clamped to `[0, 1]`.
fn calculate_importance(content: &Value, duration: Duration) -> f64 {
    let mut score = 0.0;
    if content.get("status").and_then(Value::as_str) == Some("failed") {
        score += 0.3;
    }
    if duration.as_secs_f64() > 5.0 {
        score += 0.2;
    }
    if content.get("result").map(|r| !r.is_null()).unwrap_or(false) {
        score += 0.1;
    }
    score.min(1.0)
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (TaskLifecycleManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let manager = TaskLifecycleManager::new(path).unwrap();
        (manager, dir)
    }

    #[tokio::test]
    async fn start_then_finish_persists_completed_status() {
        let (manager, _dir) = manager();
        manager.start_task("r1", "conv-a", "list my files").await;
        manager.finish_task("r1", Some("done"), None).await;

        let tasks = manager.get_active_context(Some("conv-a")).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].content["status"], "completed");
    }

    #[tokio::test]
    async fn finish_with_error_marks_failed_and_raises_importance() {
        let (manager, _dir) = manager();
        manager.start_task("r2", "conv-a", "run a risky thing").await;
        manager.finish_task("r2", None, Some("boom")).await;

        let tasks = manager.get_active_context(Some("conv-a")).await.unwrap();
        assert_eq!(tasks[0].content["status"], "failed");
        assert!(tasks[0].importance >= 0.3);
    }

    #[tokio::test]
    async fn overflow_beyond_active_limit_moves_oldest_to_archive() {
        let (manager, _dir) = manager();
        for i in 0..12 {
            let rid = format!("r{i}");
            manager.start_task(&rid, "conv-b", "task").await;
            manager.finish_task(&rid, Some("ok"), None).await;
        }
        let count = manager.get_active_count("conv-b").await.unwrap();
        assert_eq!(count, ACTIVE_LIMIT);
    }

    #[test]
    fn calculate_importance_clamps_to_one() {
        let content = json!({"status": "failed", "result": "x"});
        let score = calculate_importance(&content, Duration::from_secs(10));
        assert!(score <= 1.0);
        assert!((score - 0.6).abs() < 1e-9);
    }
}

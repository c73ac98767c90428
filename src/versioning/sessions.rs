//! Session records for the approval workflow.
//!
//! A session is a per-dialog work bucket: checkpoints accumulate on its ref
//! until the user approves (merge into `main`, status `merged`) or resets
//! (status `abandoned`). Exactly one session per dialog is `active` at any
//! time. Records live in the shared dialog database.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;

/// Name of the first session of every dialog.
pub const INITIAL_SESSION: &str = "session_1";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SessionRecord {
    pub session_name: String,
    pub ref_name: String,
    pub status: String,
    pub created_at: String,
    pub closed_at: Option<String>,
    pub approved_commit: Option<String>,
    pub checkpoints_count: i64,
}

/// `session_N` -> `session_{N+1}`.
pub fn next_session_name(current: &str) -> String {
    let n: u64 = current
        .rsplit('_')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);
    format!("session_{}", n + 1)
}

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dialog_id TEXT NOT NULL,
                session_name TEXT NOT NULL,
                ref_name TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                closed_at TEXT,
                approved_commit TEXT,
                checkpoints_count INTEGER NOT NULL DEFAULT 0,
                UNIQUE(dialog_id, session_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_sessions_dialog_status ON sessions(dialog_id, status)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn active_session(&self, dialog_id: &str) -> Result<Option<SessionRecord>> {
        let record = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT session_name, ref_name, status, created_at, closed_at,
                   approved_commit, checkpoints_count
            FROM sessions
            WHERE dialog_id = ? AND status = 'active'
            LIMIT 1
            "#,
        )
        .bind(dialog_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Return the active session, creating `session_1` if the dialog has none.
    pub async fn ensure_active(&self, dialog_id: &str) -> Result<SessionRecord> {
        if let Some(record) = self.active_session(dialog_id).await? {
            return Ok(record);
        }
        self.create(dialog_id, INITIAL_SESSION).await?;
        self.active_session(dialog_id)
            .await?
            .context("failed to create initial session")
    }

    pub async fn create(&self, dialog_id: &str, session_name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions
                (dialog_id, session_name, ref_name, status, created_at, checkpoints_count)
            VALUES (?, ?, ?, 'active', ?, 0)
            ON CONFLICT(dialog_id, session_name) DO NOTHING
            "#,
        )
        .bind(dialog_id)
        .bind(session_name)
        .bind(format!("refs/{session_name}"))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a session `merged` or `abandoned`.
    pub async fn close(
        &self,
        dialog_id: &str,
        session_name: &str,
        status: &str,
        approved_commit: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET status = ?, closed_at = ?, approved_commit = ?
            WHERE dialog_id = ? AND session_name = ?
            "#,
        )
        .bind(status)
        .bind(Utc::now().to_rfc3339())
        .bind(approved_commit)
        .bind(dialog_id)
        .bind(session_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn increment_checkpoints(&self, dialog_id: &str, session_name: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET checkpoints_count = checkpoints_count + 1
            WHERE dialog_id = ? AND session_name = ?
            "#,
        )
        .bind(dialog_id)
        .bind(session_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SessionStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = SessionStore::new(pool);
        store.ensure_schema().await.unwrap();
        store
    }

    #[test]
    fn next_name_increments() {
        assert_eq!(next_session_name("session_1"), "session_2");
        assert_eq!(next_session_name("session_9"), "session_10");
    }

    #[tokio::test]
    async fn ensure_active_creates_initial_session() {
        let store = memory_store().await;
        let session = store.ensure_active("d1").await.unwrap();
        assert_eq!(session.session_name, INITIAL_SESSION);
        assert_eq!(session.status, "active");
    }

    #[tokio::test]
    async fn close_then_create_keeps_single_active() {
        let store = memory_store().await;
        store.ensure_active("d1").await.unwrap();
        store
            .close("d1", INITIAL_SESSION, "merged", Some("abc"))
            .await
            .unwrap();
        store.create("d1", "session_2").await.unwrap();

        let active = store.active_session("d1").await.unwrap().unwrap();
        assert_eq!(active.session_name, "session_2");
    }

    #[tokio::test]
    async fn sessions_are_dialog_scoped() {
        let store = memory_store().await;
        store.ensure_active("d1").await.unwrap();
        store.ensure_active("d2").await.unwrap();
        store.close("d1", INITIAL_SESSION, "abandoned", None).await.unwrap();

        assert!(store.active_session("d1").await.unwrap().is_none());
        assert!(store.active_session("d2").await.unwrap().is_some());
    }
}

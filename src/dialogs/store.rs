//! SQLite-backed dialog store.
//!
//! One database per project (`dialogs/messages.sqlite`) holds messages,
//! reasoning blocks, file edits, tool-result metadata, summaries, usage and
//! session records for every dialog. Message `idx` values are dense per
//! dialog, starting at 0, and the sequence is append-only.

use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::types::{
    DialogSummary, DialogUsage, FileEditRecord, MessageRole, ReasoningBlock, StoredMessage,
    ToolCallRecord, ToolResultMeta, ToolResultRef,
};
use crate::versioning::sessions::SessionStore;

fn gzip(content: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let _ = encoder.write_all(content.as_bytes());
    encoder.finish().unwrap_or_default()
}

fn gunzip(bytes: &[u8]) -> String {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = String::new();
    if decoder.read_to_string(&mut out).is_err() {
        // Stored before compression was introduced, or corrupt.
        return String::from_utf8_lossy(bytes).into_owned();
    }
    out
}

/// Cursor page of dialog history.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryPage {
    pub events: Vec<StoredMessage>,
    pub total_events: i64,
    pub has_more: bool,
    pub first_idx: Option<i64>,
    pub last_idx: Option<i64>,
}

/// Cheap-clone handle over the shared dialog database.
#[derive(Clone)]
pub struct DialogStore {
    pool: SqlitePool,
}

impl DialogStore {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .context("connecting to dialog database")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                dialog_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                checkpoint_id TEXT,
                session_name TEXT,
                tool_calls TEXT,
                tool_result TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (dialog_id, idx)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reasoning (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dialog_id TEXT NOT NULL,
                message_idx INTEGER NOT NULL,
                content BLOB NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_edits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dialog_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                diff BLOB,
                checkpoint_id TEXT,
                message_idx INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tool_result_meta (
                dialog_id TEXT NOT NULL,
                tool_call_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                status TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                summary TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                PRIMARY KEY (dialog_id, tool_call_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS summaries (
                dialog_id TEXT PRIMARY KEY,
                summary_text TEXT NOT NULL,
                summarized_count INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage (
                dialog_id TEXT PRIMARY KEY,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                model_name TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        SessionStore::new(self.pool.clone()).ensure_schema().await?;
        Ok(())
    }

    // ---- messages ----

    async fn append_message(
        &self,
        dialog_id: &str,
        role: MessageRole,
        content: &str,
        checkpoint_id: Option<&str>,
        session_name: Option<&str>,
        tool_calls: Option<&[ToolCallRecord]>,
        tool_result: Option<&ToolResultRef>,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let idx: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(idx) + 1, 0) FROM messages WHERE dialog_id = ?")
                .bind(dialog_id)
                .fetch_one(&mut *tx)
                .await?;
        let tool_calls_json = match tool_calls {
            Some(calls) if !calls.is_empty() => Some(serde_json::to_string(calls)?),
            _ => None,
        };
        let tool_result_json = match tool_result {
            Some(result) => Some(serde_json::to_string(result)?),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO messages
                (dialog_id, idx, role, content, checkpoint_id, session_name,
                 tool_calls, tool_result, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(dialog_id)
        .bind(idx)
        .bind(role.as_str())
        .bind(content)
        .bind(checkpoint_id)
        .bind(session_name)
        .bind(tool_calls_json)
        .bind(tool_result_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(idx)
    }

    pub async fn add_user_message(
        &self,
        dialog_id: &str,
        content: &str,
        checkpoint_id: &str,
        session_name: &str,
    ) -> Result<i64> {
        self.append_message(
            dialog_id,
            MessageRole::User,
            content,
            Some(checkpoint_id),
            Some(session_name),
            None,
            None,
        )
        .await
    }

    pub async fn add_assistant_message(
        &self,
        dialog_id: &str,
        content: &str,
        tool_calls: &[ToolCallRecord],
    ) -> Result<i64> {
        self.append_message(
            dialog_id,
            MessageRole::Assistant,
            content,
            None,
            None,
            Some(tool_calls),
            None,
        )
        .await
    }

    pub async fn add_tool_message(
        &self,
        dialog_id: &str,
        result_ref: &ToolResultRef,
    ) -> Result<i64> {
        self.append_message(
            dialog_id,
            MessageRole::Tool,
            "",
            None,
            None,
            None,
            Some(result_ref),
        )
        .await
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> StoredMessage {
        let role = MessageRole::parse(row.get::<String, _>("role").as_str())
            .unwrap_or(MessageRole::System);
        let tool_calls = row
            .get::<Option<String>, _>("tool_calls")
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default();
        let tool_result = row
            .get::<Option<String>, _>("tool_result")
            .and_then(|json| serde_json::from_str(&json).ok());
        StoredMessage {
            idx: row.get("idx"),
            role,
            content: row.get("content"),
            checkpoint_id: row.get("checkpoint_id"),
            session_name: row.get("session_name"),
            tool_calls,
            tool_result,
            created_at: row.get("created_at"),
        }
    }

    /// All messages in order; with `limit`, only the trailing window.
    pub async fn get_messages(
        &self,
        dialog_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = match limit {
            Some(limit) => {
                sqlx::query(
                    r#"
                    SELECT * FROM (
                        SELECT * FROM messages WHERE dialog_id = ?
                        ORDER BY idx DESC LIMIT ?
                    ) ORDER BY idx ASC
                    "#,
                )
                .bind(dialog_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM messages WHERE dialog_id = ? ORDER BY idx ASC")
                    .bind(dialog_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(Self::row_to_message).collect())
    }

    pub async fn count_messages(&self, dialog_id: &str) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE dialog_id = ?")
            .bind(dialog_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Cursor-paginated history: up to `limit` events with `idx < before`
    /// (or the tail when `before` is absent), ascending within the page.
    pub async fn history_page(
        &self,
        dialog_id: &str,
        limit: i64,
        before: Option<i64>,
    ) -> Result<HistoryPage> {
        let total_events = self.count_messages(dialog_id).await?;
        let before = before.unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT * FROM messages WHERE dialog_id = ? AND idx < ?
                ORDER BY idx DESC LIMIT ?
            ) ORDER BY idx ASC
            "#,
        )
        .bind(dialog_id)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let events: Vec<StoredMessage> = rows.iter().map(Self::row_to_message).collect();
        let first_idx = events.first().map(|m| m.idx);
        let last_idx = events.last().map(|m| m.idx);
        let has_more = first_idx.map(|idx| idx > 0).unwrap_or(false);
        Ok(HistoryPage {
            events,
            total_events,
            has_more,
            first_idx,
            last_idx,
        })
    }

    /// Drop all rows belonging to a dialog (dialog deletion).
    pub async fn delete_dialog(&self, dialog_id: &str) -> Result<()> {
        for table in [
            "messages",
            "reasoning",
            "file_edits",
            "tool_result_meta",
            "summaries",
            "usage",
            "sessions",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE dialog_id = ?"))
                .bind(dialog_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    // ---- reasoning ----

    /// Store a reasoning block (gzip-compressed) linked to the assistant
    /// message that follows at `message_idx`.
    pub async fn save_reasoning(
        &self,
        dialog_id: &str,
        message_idx: i64,
        content: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO reasoning (dialog_id, message_idx, content, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(dialog_id)
        .bind(message_idx)
        .bind(gzip(content))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn load_reasoning(&self, dialog_id: &str) -> Result<Vec<ReasoningBlock>> {
        let rows = sqlx::query(
            "SELECT id, message_idx, content, created_at FROM reasoning \
             WHERE dialog_id = ? ORDER BY id ASC",
        )
        .bind(dialog_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| ReasoningBlock {
                id: row.get("id"),
                message_idx: row.get("message_idx"),
                content: gunzip(&row.get::<Vec<u8>, _>("content")),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    // ---- file edits ----

    pub async fn save_file_edit(
        &self,
        dialog_id: &str,
        file_path: &str,
        diff: Option<&str>,
        checkpoint_id: Option<&str>,
        message_idx: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_edits
                (dialog_id, file_path, diff, checkpoint_id, message_idx, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(dialog_id)
        .bind(file_path)
        .bind(diff.map(gzip))
        .bind(checkpoint_id)
        .bind(message_idx)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_file_edits(&self, dialog_id: &str) -> Result<Vec<FileEditRecord>> {
        let rows = sqlx::query(
            "SELECT file_path, diff, checkpoint_id, message_idx, created_at \
             FROM file_edits WHERE dialog_id = ? ORDER BY id ASC",
        )
        .bind(dialog_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| FileEditRecord {
                file_path: row.get("file_path"),
                diff: row.get::<Option<Vec<u8>>, _>("diff").map(|b| gunzip(&b)),
                checkpoint_id: row.get("checkpoint_id"),
                message_idx: row.get("message_idx"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    // ---- tool result metadata ----

    pub async fn save_tool_result_meta(
        &self,
        dialog_id: &str,
        meta: &ToolResultMeta,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO tool_result_meta
                (dialog_id, tool_call_id, tool_name, status, size_bytes, summary, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(dialog_id)
        .bind(&meta.tool_call_id)
        .bind(&meta.tool_name)
        .bind(&meta.status)
        .bind(meta.size_bytes as i64)
        .bind(&meta.summary)
        .bind(&meta.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_tool_result_meta(&self, dialog_id: &str) -> Result<Vec<ToolResultMeta>> {
        let rows = sqlx::query(
            "SELECT tool_call_id, tool_name, status, size_bytes, summary, created_at \
             FROM tool_result_meta WHERE dialog_id = ? ORDER BY created_at ASC",
        )
        .bind(dialog_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| ToolResultMeta {
                tool_call_id: row.get("tool_call_id"),
                tool_name: row.get("tool_name"),
                status: row.get("status"),
                size_bytes: row.get::<i64, _>("size_bytes") as u64,
                summary: row.get("summary"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    // ---- summaries ----

    pub async fn save_summary(
        &self,
        dialog_id: &str,
        summary_text: &str,
        summarized_count: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO summaries
                (dialog_id, summary_text, summarized_count, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(dialog_id)
        .bind(summary_text)
        .bind(summarized_count)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_summary(&self, dialog_id: &str) -> Result<Option<DialogSummary>> {
        let row = sqlx::query(
            "SELECT summary_text, summarized_count, updated_at FROM summaries WHERE dialog_id = ?",
        )
        .bind(dialog_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| DialogSummary {
            summary_text: row.get("summary_text"),
            summarized_count: row.get("summarized_count"),
            updated_at: row.get("updated_at"),
        }))
    }

    // ---- usage ----

    pub async fn upsert_usage(
        &self,
        dialog_id: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        model_name: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage
                (dialog_id, prompt_tokens, completion_tokens, total_tokens, model_name, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(dialog_id) DO UPDATE SET
                prompt_tokens = prompt_tokens + excluded.prompt_tokens,
                completion_tokens = completion_tokens + excluded.completion_tokens,
                total_tokens = total_tokens + excluded.total_tokens,
                model_name = excluded.model_name,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(dialog_id)
        .bind(prompt_tokens)
        .bind(completion_tokens)
        .bind(prompt_tokens + completion_tokens)
        .bind(model_name)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_usage(&self, dialog_id: &str) -> Result<DialogUsage> {
        let row = sqlx::query(
            "SELECT prompt_tokens, completion_tokens, total_tokens, model_name \
             FROM usage WHERE dialog_id = ?",
        )
        .bind(dialog_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|row| DialogUsage {
                prompt_tokens: row.get("prompt_tokens"),
                completion_tokens: row.get("completion_tokens"),
                total_tokens: row.get("total_tokens"),
                model_name: row.get("model_name"),
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn message_indices_are_dense_from_zero() {
        let store = DialogStore::open_memory().await.unwrap();
        let i0 = store
            .add_user_message("d1", "hello", "cp1", "session_1")
            .await
            .unwrap();
        let i1 = store.add_assistant_message("d1", "hi", &[]).await.unwrap();
        assert_eq!((i0, i1), (0, 1));

        // Another dialog starts over at zero.
        let j0 = store
            .add_user_message("d2", "yo", "cp2", "session_1")
            .await
            .unwrap();
        assert_eq!(j0, 0);
    }

    #[tokio::test]
    async fn user_message_keeps_checkpoint_and_session() {
        let store = DialogStore::open_memory().await.unwrap();
        store
            .add_user_message("d1", "write code", "abc123", "session_1")
            .await
            .unwrap();
        let messages = store.get_messages("d1", None).await.unwrap();
        assert_eq!(messages[0].checkpoint_id.as_deref(), Some("abc123"));
        assert_eq!(messages[0].session_name.as_deref(), Some("session_1"));
    }

    #[tokio::test]
    async fn assistant_tool_calls_roundtrip() {
        let store = DialogStore::open_memory().await.unwrap();
        let calls = vec![ToolCallRecord {
            id: "call_1".into(),
            name: "write_to_file".into(),
            args: json!({"path": "main.py"}),
        }];
        store
            .add_assistant_message("d1", "writing", &calls)
            .await
            .unwrap();
        let messages = store.get_messages("d1", None).await.unwrap();
        assert_eq!(messages[0].tool_calls.len(), 1);
        assert_eq!(messages[0].tool_calls[0].name, "write_to_file");
    }

    #[tokio::test]
    async fn history_page_cursor_walks_backwards() {
        let store = DialogStore::open_memory().await.unwrap();
        for i in 0..5 {
            store
                .add_user_message("d1", &format!("m{i}"), "cp", "session_1")
                .await
                .unwrap();
        }
        let page = store.history_page("d1", 2, None).await.unwrap();
        assert_eq!(page.total_events, 5);
        assert_eq!(page.first_idx, Some(3));
        assert_eq!(page.last_idx, Some(4));
        assert!(page.has_more);

        let earlier = store.history_page("d1", 2, page.first_idx).await.unwrap();
        assert_eq!(earlier.first_idx, Some(1));
        assert!(earlier.has_more);

        let first = store.history_page("d1", 2, earlier.first_idx).await.unwrap();
        assert_eq!(first.first_idx, Some(0));
        assert!(!first.has_more);
    }

    #[tokio::test]
    async fn reasoning_compresses_and_restores() {
        let store = DialogStore::open_memory().await.unwrap();
        let long = "thinking... ".repeat(500);
        store.save_reasoning("d1", 3, &long).await.unwrap();
        let blocks = store.load_reasoning("d1").await.unwrap();
        assert_eq!(blocks[0].content, long);
        assert_eq!(blocks[0].message_idx, 3);
    }

    #[tokio::test]
    async fn file_edit_diff_roundtrips() {
        let store = DialogStore::open_memory().await.unwrap();
        let diff = "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n";
        store
            .save_file_edit("d1", "x.txt", Some(diff), Some("cp1"), 2)
            .await
            .unwrap();
        let edits = store.list_file_edits("d1").await.unwrap();
        assert_eq!(edits[0].diff.as_deref(), Some(diff));
        assert_eq!(edits[0].checkpoint_id.as_deref(), Some("cp1"));
    }

    #[tokio::test]
    async fn usage_accumulates() {
        let store = DialogStore::open_memory().await.unwrap();
        store.upsert_usage("d1", 100, 20, Some("gpt-5.1")).await.unwrap();
        store.upsert_usage("d1", 50, 10, Some("gpt-5.1")).await.unwrap();
        let usage = store.get_usage("d1").await.unwrap();
        assert_eq!(usage.prompt_tokens, 150);
        assert_eq!(usage.completion_tokens, 30);
        assert_eq!(usage.total_tokens, 180);
    }

    #[tokio::test]
    async fn delete_dialog_clears_all_tables() {
        let store = DialogStore::open_memory().await.unwrap();
        store
            .add_user_message("d1", "hi", "cp", "session_1")
            .await
            .unwrap();
        store.save_reasoning("d1", 0, "thought").await.unwrap();
        store.delete_dialog("d1").await.unwrap();
        assert_eq!(store.count_messages("d1").await.unwrap(), 0);
        assert!(store.load_reasoning("d1").await.unwrap().is_empty());
    }
}

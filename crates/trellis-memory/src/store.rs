use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::MemoryStore;
use trellis_core::types::{ChatMessage, Role, SessionId};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        thread_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_thread
        ON messages(thread_id, id);";

fn db_err(e: impl std::fmt::Display) -> TrellisError {
    TrellisError::Database(e.to_string())
}

/// SQLite-backed conversation store.
///
/// A single connection sits behind a mutex, so appends to any thread are
/// serialized.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Rows of (role, JSON content, RFC 3339 timestamp) ready to insert.
fn encode_rows(msgs: &[ChatMessage]) -> Result<Vec<(&'static str, String, String)>> {
    msgs.iter()
        .map(|m| {
            let content = serde_json::to_string(&m.content)?;
            let timestamp = m.timestamp.unwrap_or_else(Utc::now).to_rfc3339();
            Ok((m.role.as_str(), content, timestamp))
        })
        .collect()
}

impl MemoryStore for SqliteStore {
    fn append_messages(
        &self,
        thread: &SessionId,
        msgs: &[ChatMessage],
    ) -> BoxFuture<'_, Result<()>> {
        let thread = thread.0.clone();
        let rows = encode_rows(msgs);

        Box::pin(async move {
            let rows = rows?;
            let mut conn = self.conn.lock().map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;
            for (role, content, timestamp) in &rows {
                tx.execute(
                    "INSERT INTO messages (thread_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
                    params![thread, role, content, timestamp],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;

            debug!(thread_id = %thread, count = rows.len(), "Appended messages");
            Ok(())
        })
    }

    fn load_history(
        &self,
        thread: &SessionId,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        let thread = thread.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;

            let mut stmt = conn
                .prepare(
                    "SELECT role, content, timestamp FROM (
                         SELECT id, role, content, timestamp FROM messages
                         WHERE thread_id = ?1
                         ORDER BY id DESC
                         LIMIT ?2
                     ) ORDER BY id ASC",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![thread, limit as i64], |row| {
                    let role: String = row.get(0)?;
                    let content: String = row.get(1)?;
                    let ts: String = row.get(2)?;
                    Ok((role, content, ts))
                })
                .map_err(db_err)?;

            let mut messages = Vec::new();
            for row in rows {
                let (role, content, ts) = row.map_err(db_err)?;
                messages.push(ChatMessage {
                    role: Role::parse(&role),
                    content: serde_json::from_str(&content)?,
                    timestamp: DateTime::parse_from_rfc3339(&ts)
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc)),
                });
            }

            Ok(messages)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_rows_keeps_content() {
        let mut untimed = ChatMessage::assistant_text("Hi there!");
        untimed.timestamp = None;
        let rows = encode_rows(&[ChatMessage::user("Hello"), untimed]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "user");
        assert_eq!(rows[1].0, "assistant");
        for (_, content, timestamp) in &rows {
            assert!(!content.is_empty());
            let blocks: serde_json::Value = serde_json::from_str(content).unwrap();
            assert!(blocks.is_array());
            assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
        }
        assert!(rows[1].1.contains("Hi there!"));
    }

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let store = SqliteStore::in_memory().unwrap();
        let sid = SessionId::new();

        let msgs = vec![
            ChatMessage::user("Hello"),
            ChatMessage::assistant_text("Hi there!"),
        ];

        store.append_messages(&sid, &msgs).await.unwrap();
        let history = store.load_history(&sid, 100).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].text(), "Hi there!");
    }

    #[tokio::test]
    async fn test_limit_keeps_most_recent() {
        let store = SqliteStore::in_memory().unwrap();
        let sid = SessionId::from_str("thread-a");
        for i in 0..5 {
            store
                .append_messages(&sid, &[ChatMessage::user(format!("m{}", i))])
                .await
                .unwrap();
        }
        let history = store.load_history(&sid, 2).await.unwrap();
        let texts: Vec<_> = history.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn test_threads_are_isolated() {
        let store = SqliteStore::in_memory().unwrap();
        let a = SessionId::from_str("a");
        let b = SessionId::from_str("b");
        store.append_messages(&a, &[ChatMessage::user("for a")]).await.unwrap();
        store.append_messages(&b, &[ChatMessage::user("for b")]).await.unwrap();

        let ha = store.load_history(&a, 10).await.unwrap();
        assert_eq!(ha.len(), 1);
        assert_eq!(ha[0].text(), "for a");
    }

    #[tokio::test]
    async fn test_file_backed_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.db");
        let sid = SessionId::from_str("persist");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .append_messages(&sid, &[ChatMessage::user("remember me")])
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let history = store.load_history(&sid, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text(), "remember me");
    }
}

mod kb;
mod tasks;

pub use kb::{KbChunk, KbSource};
pub use tasks::{ContextMode, ScheduleType, Task, TaskStatus};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A chat observed on the transport. Created lazily on first message,
/// refreshed by metadata sync.
#[derive(Debug, Clone)]
pub struct Chat {
    pub jid: String,
    pub name: String,
    pub last_message_time: String,
}

/// A single transport message. Immutable once written.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub chat_jid: String,
    pub sender_name: String,
    pub from_assistant: bool,
    pub content: String,
    /// RFC 3339 UTC. Message order within a chat is total by this field.
    pub timestamp: String,
}

/// Embedded SQLite store for chats, messages, scheduled tasks and the
/// knowledge base. All writes are serialized behind the connection mutex;
/// multi-row mutations run inside transactions so a row is never half
/// written.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed to create database parent directory: {}",
                    parent.display()
                )
            })?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at: {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             PRAGMA foreign_keys=ON;",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store
            .ensure_schema()
            .with_context(|| format!("Failed to initialize schema at: {}", db_path.display()))?;
        Ok(store)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chats (
                jid TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                last_message_time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_jid TEXT NOT NULL,
                sender_name TEXT NOT NULL,
                from_assistant INTEGER NOT NULL DEFAULT 0,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat_ts
                ON messages(chat_jid, timestamp);

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                group_folder TEXT NOT NULL,
                chat_jid TEXT NOT NULL,
                prompt TEXT NOT NULL,
                schedule_type TEXT NOT NULL,
                schedule_value TEXT NOT NULL,
                context_mode TEXT NOT NULL DEFAULT 'group',
                next_run TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status_next
                ON tasks(status, next_run);

            CREATE TABLE IF NOT EXISTS kb_sources (
                id TEXT PRIMARY KEY,
                group_folder TEXT NOT NULL,
                url TEXT,
                title TEXT NOT NULL,
                source_type TEXT NOT NULL,
                raw_content TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                tags TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (group_folder, content_hash),
                UNIQUE (group_folder, url)
            );

            CREATE TABLE IF NOT EXISTS kb_chunks (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL REFERENCES kb_sources(id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB,
                embedding_dim INTEGER,
                embedding_provider TEXT,
                embedding_model TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_kb_chunks_source
                ON kb_chunks(source_id);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    pub(crate) fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("store lock poisoned: {}", e))
    }

    /// Upsert chat metadata, keeping the newest last_message_time.
    pub fn store_chat(&self, jid: &str, name: &str, last_message_time: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO chats (jid, name, last_message_time)
             VALUES (?, ?, ?)
             ON CONFLICT(jid) DO UPDATE SET
                 name = excluded.name,
                 last_message_time = MAX(last_message_time, excluded.last_message_time)",
            params![jid, name, last_message_time],
        )?;
        Ok(())
    }

    pub fn get_chat(&self, jid: &str) -> Result<Option<Chat>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT jid, name, last_message_time FROM chats WHERE jid = ?",
            [jid],
            |row| {
                Ok(Chat {
                    jid: row.get(0)?,
                    name: row.get(1)?,
                    last_message_time: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_chats(&self) -> Result<Vec<Chat>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT jid, name, last_message_time FROM chats ORDER BY last_message_time DESC",
        )?;
        let rows: Result<Vec<_>, _> = stmt
            .query_map([], |row| {
                Ok(Chat {
                    jid: row.get(0)?,
                    name: row.get(1)?,
                    last_message_time: row.get(2)?,
                })
            })?
            .collect();
        rows.map_err(Into::into)
    }

    /// Append a message. Duplicate transport ids are ignored so webhook
    /// redeliveries stay idempotent.
    pub fn store_message(&self, msg: &Message) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO messages
                 (id, chat_jid, sender_name, from_assistant, content, timestamp)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                msg.id,
                msg.chat_jid,
                msg.sender_name,
                msg.from_assistant,
                msg.content,
                msg.timestamp
            ],
        )?;
        Ok(())
    }

    /// Messages strictly newer than `since` across the registered jids,
    /// excluding the assistant's own messages (self-loop guard: both the
    /// `from_assistant` flag and the bot display names are filtered).
    pub fn get_new_messages(
        &self,
        registered_jids: &[String],
        since: &str,
        bot_prefixes: &[String],
    ) -> Result<Vec<Message>> {
        if registered_jids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock_conn()?;

        let jid_marks = vec!["?"; registered_jids.len()].join(", ");
        let bot_marks = if bot_prefixes.is_empty() {
            "''".to_string()
        } else {
            vec!["?"; bot_prefixes.len()].join(", ")
        };
        let sql = format!(
            "SELECT id, chat_jid, sender_name, from_assistant, content, timestamp
             FROM messages
             WHERE chat_jid IN ({jid_marks})
               AND timestamp > ?
               AND from_assistant = 0
               AND sender_name NOT IN ({bot_marks})
             ORDER BY timestamp ASC"
        );

        let mut values: Vec<&dyn rusqlite::ToSql> = Vec::new();
        for jid in registered_jids {
            values.push(jid);
        }
        values.push(&since);
        for prefix in bot_prefixes {
            values.push(prefix);
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows: Result<Vec<_>, _> = stmt
            .query_map(values.as_slice(), |row| {
                Ok(Message {
                    id: row.get(0)?,
                    chat_jid: row.get(1)?,
                    sender_name: row.get(2)?,
                    from_assistant: row.get(3)?,
                    content: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            })?
            .collect();
        rows.map_err(Into::into)
    }

    /// Full context window for one chat: everything strictly after `since`,
    /// excluding the assistant's own messages.
    pub fn get_messages_since(
        &self,
        chat_jid: &str,
        since: &str,
        bot_prefix: &str,
    ) -> Result<Vec<Message>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, chat_jid, sender_name, from_assistant, content, timestamp
             FROM messages
             WHERE chat_jid = ?
               AND timestamp > ?
               AND from_assistant = 0
               AND sender_name != ?
             ORDER BY timestamp ASC",
        )?;
        let rows: Result<Vec<_>, _> = stmt
            .query_map(params![chat_jid, since, bot_prefix], |row| {
                Ok(Message {
                    id: row.get(0)?,
                    chat_jid: row.get(1)?,
                    sender_name: row.get(2)?,
                    from_assistant: row.get(3)?,
                    content: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            })?
            .collect();
        rows.map_err(Into::into)
    }

    pub fn set_last_group_sync(&self, ts: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES ('last_group_sync', ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [ts],
        )?;
        Ok(())
    }

    pub fn last_group_sync(&self) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT value FROM settings WHERE key = 'last_group_sync'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }
}

/// Run a blocking store operation off the async runtime.
pub async fn call_blocking<T, F>(store: Arc<Store>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Store) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| anyhow::anyhow!("store task join error: {}", e))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, chat: &str, sender: &str, content: &str, ts: &str) -> Message {
        Message {
            id: id.to_string(),
            chat_jid: chat.to_string(),
            sender_name: sender.to_string(),
            from_assistant: false,
            content: content.to_string(),
            timestamp: ts.to_string(),
        }
    }

    #[test]
    fn store_message_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let m = msg("m1", "123@g.us", "Ada", "hello", "2026-02-01T10:00:00Z");
        store.store_message(&m).unwrap();
        store.store_message(&m).unwrap();
        let got = store
            .get_new_messages(&["123@g.us".to_string()], "", &[])
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn get_new_messages_filters_and_orders() {
        let store = Store::open_in_memory().unwrap();
        let jid = "123@g.us".to_string();
        store
            .store_message(&msg("m2", &jid, "Ada", "second", "2026-02-01T10:00:02Z"))
            .unwrap();
        store
            .store_message(&msg("m1", &jid, "Ada", "first", "2026-02-01T10:00:01Z"))
            .unwrap();
        store
            .store_message(&msg("m3", "999@g.us", "Eve", "other chat", "2026-02-01T10:00:03Z"))
            .unwrap();
        store
            .store_message(&msg("m4", &jid, "bhai", "bot echo", "2026-02-01T10:00:04Z"))
            .unwrap();

        let got = store
            .get_new_messages(&[jid], "2026-02-01T10:00:00Z", &["bhai".to_string()])
            .unwrap();
        let contents: Vec<&str> = got.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[test]
    fn get_new_messages_strictly_newer() {
        let store = Store::open_in_memory().unwrap();
        let jid = "123@g.us".to_string();
        store
            .store_message(&msg("m1", &jid, "Ada", "boundary", "2026-02-01T10:00:00Z"))
            .unwrap();
        let got = store
            .get_new_messages(&[jid], "2026-02-01T10:00:00Z", &[])
            .unwrap();
        assert!(got.is_empty(), "boundary timestamp must be excluded");
    }

    #[test]
    fn from_assistant_messages_excluded() {
        let store = Store::open_in_memory().unwrap();
        let jid = "123@g.us".to_string();
        let mut m = msg("m1", &jid, "Ada", "mine", "2026-02-01T10:00:01Z");
        m.from_assistant = true;
        store.store_message(&m).unwrap();
        let got = store.get_messages_since(&jid, "", "bhai").unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn chat_upsert_keeps_newest_time() {
        let store = Store::open_in_memory().unwrap();
        store
            .store_chat("123@g.us", "Family", "2026-02-01T10:00:05Z")
            .unwrap();
        store
            .store_chat("123@g.us", "Family Renamed", "2026-02-01T09:00:00Z")
            .unwrap();
        let chat = store.get_chat("123@g.us").unwrap().unwrap();
        assert_eq!(chat.name, "Family Renamed");
        assert_eq!(chat.last_message_time, "2026-02-01T10:00:05Z");
    }

    #[test]
    fn last_group_sync_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.last_group_sync().unwrap().is_none());
        store.set_last_group_sync("2026-02-01T10:00:00Z").unwrap();
        assert_eq!(
            store.last_group_sync().unwrap().as_deref(),
            Some("2026-02-01T10:00:00Z")
        );
    }
}

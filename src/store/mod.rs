pub mod media;
pub mod messages;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::Result;
use crate::model::{MediaReference, MessageRecord};

/// Row counts reported by the heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub messages: u64,
    pub media_pending: u64,
    pub media_fetched: u64,
    pub media_failed: u64,
}

/// Relational contract the committer and media fetcher write through.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn exists(&self, channel_id: &str, message_id: i64) -> Result<bool>;

    /// Insert the message and its media rows in one transaction.
    /// Returns `false`, writing nothing, when the key is already stored.
    async fn insert_message(&self, record: &MessageRecord) -> Result<bool>;

    /// Apply one media row's status and path, keyed by
    /// `(channel_id, message_id, sequence)`.
    async fn update_media(&self, media: &MediaReference) -> Result<()>;

    async fn pending_media(&self) -> Result<Vec<MediaReference>>;

    async fn stats(&self) -> Result<StoreStats>;

    /// Messages sent in `[from, to]`, newest first, with their media.
    async fn query_messages(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>>;
}

/// Thread-safe SQLite message store
#[derive(Clone)]
pub struct MessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl MessageStore {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;

        // Migrate before wrapping in the async Mutex.
        Self::run_migrations(&conn)?;

        info!("Message store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                received_at TEXT NOT NULL,
                name TEXT,
                description TEXT,
                link TEXT,
                file_size TEXT,
                tags TEXT,
                UNIQUE (channel_id, message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_sent
                ON messages(sent_at);

            CREATE TABLE IF NOT EXISTS media (
                channel_id TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                kind TEXT NOT NULL,
                remote_id TEXT NOT NULL,
                local_path TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (channel_id, message_id, sequence),
                FOREIGN KEY (channel_id, message_id)
                    REFERENCES messages(channel_id, message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_media_status
                ON media(status);
            ",
        )
        .context("Failed to run migrations")?;

        Ok(())
    }
}

#[async_trait]
impl Storage for MessageStore {
    async fn exists(&self, channel_id: &str, message_id: i64) -> Result<bool> {
        self.message_exists(channel_id, message_id).await
    }

    async fn insert_message(&self, record: &MessageRecord) -> Result<bool> {
        self.insert_record(record).await
    }

    async fn update_media(&self, media: &MediaReference) -> Result<()> {
        self.set_media_state(media).await
    }

    async fn pending_media(&self) -> Result<Vec<MediaReference>> {
        self.load_pending_media().await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.load_stats().await
    }

    async fn query_messages(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>> {
        MessageStore::query_messages(self, from, to).await
    }
}

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::OptionalExtension;

use super::{MessageStore, StoreStats};
use crate::error::{IngestError, Result};
use crate::model::{MessageRecord, PostDetails};

/// Fixed-width UTC form, so stored timestamps order correctly as text.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| IngestError::storage(format!("bad timestamp '{}': {}", value, e)))
}

/// Columns shared by every message read, in `message_row` order.
const MESSAGE_COLUMNS: &str =
    "channel_id, message_id, text, sent_at, received_at, name, description, link, file_size, tags";

/// A message row before its timestamps are parsed and media attached.
struct MessageRow {
    channel_id: String,
    message_id: i64,
    text: String,
    sent_at: String,
    received_at: String,
    details: PostDetails,
}

fn message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        channel_id: row.get(0)?,
        message_id: row.get(1)?,
        text: row.get(2)?,
        sent_at: row.get(3)?,
        received_at: row.get(4)?,
        details: PostDetails {
            name: row.get(5)?,
            description: row.get(6)?,
            link: row.get(7)?,
            file_size: row.get(8)?,
            tags: row.get(9)?,
        },
    })
}

impl MessageStore {
    pub async fn message_exists(&self, channel_id: &str, message_id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM messages WHERE channel_id = ?1 AND message_id = ?2",
                rusqlite::params![channel_id, message_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert a message with its known media rows atomically. A conflicting
    /// key leaves the stored row untouched.
    pub async fn insert_record(&self, record: &MessageRecord) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO messages
             (channel_id, message_id, text, sent_at, received_at,
              name, description, link, file_size, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(channel_id, message_id) DO NOTHING",
            rusqlite::params![
                &record.channel_id,
                record.message_id,
                &record.text,
                format_timestamp(&record.sent_at),
                format_timestamp(&record.received_at),
                &record.details.name,
                &record.details.description,
                &record.details.link,
                &record.details.file_size,
                &record.details.tags,
            ],
        )?;

        if inserted == 0 {
            return Ok(false);
        }

        for media in &record.media_refs {
            tx.execute(
                "INSERT INTO media
                 (channel_id, message_id, sequence, kind, remote_id, local_path, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    &media.channel_id,
                    media.message_id,
                    media.sequence,
                    media.kind.as_str(),
                    &media.remote_id,
                    media
                        .local_path
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned()),
                    media.status.as_str(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(true)
    }

    /// Read one message back with its media.
    #[allow(dead_code)]
    pub async fn load_message(
        &self,
        channel_id: &str,
        message_id: i64,
    ) -> Result<Option<MessageRecord>> {
        let row = {
            let conn = self.conn.lock().await;
            conn.query_row(
                &format!(
                    "SELECT {} FROM messages WHERE channel_id = ?1 AND message_id = ?2",
                    MESSAGE_COLUMNS
                ),
                rusqlite::params![channel_id, message_id],
                message_row,
            )
            .optional()?
        };

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    /// Messages sent between `from` and `to`, both inclusive, newest first.
    pub async fn query_messages(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>> {
        let rows = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages
                 WHERE sent_at >= ?1 AND sent_at <= ?2
                 ORDER BY sent_at DESC, message_id DESC",
                MESSAGE_COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![format_timestamp(&from), format_timestamp(&to)],
                    message_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(self.hydrate(row).await?);
        }
        Ok(records)
    }

    async fn hydrate(&self, row: MessageRow) -> Result<MessageRecord> {
        let media_refs = self.load_media_for(&row.channel_id, row.message_id).await?;
        Ok(MessageRecord {
            received_at: parse_timestamp(&row.received_at)?,
            sent_at: parse_timestamp(&row.sent_at)?,
            channel_id: row.channel_id,
            message_id: row.message_id,
            text: row.text,
            media_refs,
            details: row.details,
        })
    }

    pub async fn load_stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().await;
        let messages: i64 = conn.query_row("SELECT count(*) FROM messages", [], |row| row.get(0))?;

        let mut stats = StoreStats {
            messages: messages as u64,
            ..Default::default()
        };

        let mut stmt = conn.prepare("SELECT status, count(*) FROM media GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (status, count) in rows {
            match status.as_str() {
                "pending" => stats.media_pending = count as u64,
                "fetched" => stats.media_fetched = count as u64,
                "failed" => stats.media_failed = count as u64,
                _ => {}
            }
        }

        Ok(stats)
    }
}

use std::path::PathBuf;

use super::MessageStore;
use crate::error::{IngestError, Result};
use crate::model::{MediaKind, MediaReference, MediaStatus};

fn parse_media_row(row: &rusqlite::Row) -> rusqlite::Result<MediaReference> {
    let kind: String = row.get(3)?;
    let local_path: Option<String> = row.get(5)?;
    let status: String = row.get(6)?;

    Ok(MediaReference {
        channel_id: row.get(0)?,
        message_id: row.get(1)?,
        sequence: row.get(2)?,
        kind: MediaKind::from_type_tag(&kind),
        remote_id: row.get(4)?,
        local_path: local_path.map(PathBuf::from),
        // Unknown values are treated as still owed a download.
        status: MediaStatus::parse(&status).unwrap_or(MediaStatus::Pending),
    })
}

impl MessageStore {
    pub async fn set_media_state(&self, media: &MediaReference) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE media SET status = ?1, local_path = ?2, updated_at = datetime('now')
             WHERE channel_id = ?3 AND message_id = ?4 AND sequence = ?5",
            rusqlite::params![
                media.status.as_str(),
                media
                    .local_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                &media.channel_id,
                media.message_id,
                media.sequence,
            ],
        )?;

        if updated == 0 {
            return Err(IngestError::storage(format!(
                "no media row for {}/{}#{}",
                media.channel_id, media.message_id, media.sequence
            )));
        }
        Ok(())
    }

    pub async fn load_media_for(
        &self,
        channel_id: &str,
        message_id: i64,
    ) -> Result<Vec<MediaReference>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT channel_id, message_id, sequence, kind, remote_id, local_path, status
             FROM media
             WHERE channel_id = ?1 AND message_id = ?2
             ORDER BY sequence ASC",
        )?;
        let media = stmt
            .query_map(rusqlite::params![channel_id, message_id], parse_media_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(media)
    }

    /// Media rows whose download has not finished, oldest message first.
    pub async fn load_pending_media(&self) -> Result<Vec<MediaReference>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT channel_id, message_id, sequence, kind, remote_id, local_path, status
             FROM media
             WHERE status = 'pending'
             ORDER BY channel_id, message_id, sequence",
        )?;
        let media = stmt
            .query_map([], parse_media_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(media)
    }
}

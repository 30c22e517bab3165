use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::error::Result;
use crate::model::{CommitResult, MediaReference, MessageRecord};
use crate::retry::RetryPolicy;
use crate::store::Storage;

/// Writes records idempotently, one writer per channel.
pub struct Committer {
    storage: Arc<dyn Storage>,
    retry: RetryPolicy,
    writers: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Committer {
    pub fn new(storage: Arc<dyn Storage>, retry: RetryPolicy) -> Self {
        Self {
            storage,
            retry,
            writers: Mutex::new(HashMap::new()),
        }
    }

    async fn writer(&self, channel_id: &str) -> Arc<Mutex<()>> {
        let mut writers = self.writers.lock().await;
        Arc::clone(writers.entry(channel_id.to_string()).or_default())
    }

    /// Persist `record` with its currently known media.
    ///
    /// A key that is already stored is a no-op returning
    /// [`CommitResult::AlreadyExists`]. Storage failures are retried; once
    /// the budget is spent the record is logged as dropped and the error
    /// returned.
    pub async fn commit(&self, record: &MessageRecord) -> Result<CommitResult> {
        let writer = self.writer(&record.channel_id).await;
        let _guard = writer.lock().await;

        let storage = &self.storage;
        let result = self
            .retry
            .run("commit", move || async move {
                if storage.exists(&record.channel_id, record.message_id).await? {
                    return Ok(CommitResult::AlreadyExists);
                }
                // The insert re-checks the key inside its transaction.
                if storage.insert_message(record).await? {
                    Ok(CommitResult::Inserted)
                } else {
                    Ok(CommitResult::AlreadyExists)
                }
            })
            .await;

        match result {
            Ok(outcome) => {
                debug!(
                    channel_id = %record.channel_id,
                    message_id = record.message_id,
                    ?outcome,
                    "commit finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                error!(
                    channel_id = %record.channel_id,
                    message_id = record.message_id,
                    sent_at = %record.sent_at.to_rfc3339(),
                    media = record.media_refs.len(),
                    text = %record.text,
                    error = %err,
                    "DATA LOSS: message permanently dropped after storage retries were exhausted"
                );
                Err(err)
            }
        }
    }

    /// Apply a media row update from the fetcher, retried like a commit.
    pub async fn apply_media(&self, media: &MediaReference) -> Result<()> {
        let writer = self.writer(&media.channel_id).await;
        let _guard = writer.lock().await;

        let storage = &self.storage;
        let result = self
            .retry
            .run("media update", move || async move {
                storage.update_media(media).await
            })
            .await;

        if let Err(err) = &result {
            error!(
                channel_id = %media.channel_id,
                message_id = media.message_id,
                sequence = media.sequence,
                status = %media.status,
                local_path = ?media.local_path,
                error = %err,
                "media update dropped after storage retries were exhausted"
            );
        }
        result
    }
}

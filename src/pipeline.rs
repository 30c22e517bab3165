use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::committer::Committer;
use crate::error::{IngestError, Result};
use crate::media::MediaQueue;
use crate::model::CommitResult;
use crate::normalizer::normalize;
use crate::store::Storage;
use crate::transport::RawEvent;

/// Consumes raw events off the listener queue: normalize, commit, then
/// schedule attachment downloads for newly stored messages.
pub struct Pipeline {
    committer: Arc<Committer>,
    media: MediaQueue,
}

impl Pipeline {
    pub fn new(committer: Arc<Committer>, media: MediaQueue) -> Self {
        Self { committer, media }
    }

    /// Handle one event. Redelivered messages are not fetched again.
    pub async fn handle(&self, raw: RawEvent) -> Result<CommitResult> {
        let record = normalize(&raw, Utc::now())?;
        let outcome = self.committer.commit(&record).await?;

        match outcome {
            CommitResult::Inserted => {
                info!(
                    channel_id = %record.channel_id,
                    message_id = record.message_id,
                    media = record.media_refs.len(),
                    name = record.details.name.as_deref().unwrap_or(""),
                    "new message stored"
                );
                for media in record.media_refs {
                    self.media.enqueue(media);
                }
            }
            CommitResult::AlreadyExists => {
                debug!(
                    channel_id = %record.channel_id,
                    message_id = record.message_id,
                    "message already stored, skipping"
                );
            }
        }

        Ok(outcome)
    }

    /// Process events until every sender is gone. A failing event is logged
    /// and dropped; the loop keeps going.
    pub async fn run(self, mut events: mpsc::Receiver<RawEvent>) {
        while let Some(raw) = events.recv().await {
            let chat = raw
                .chat_username
                .clone()
                .or_else(|| raw.chat_id.map(|id| id.to_string()));
            let message_id = raw.message_id;

            match self.handle(raw).await {
                Ok(_) => {}
                Err(IngestError::MalformedEvent(reason)) => {
                    warn!(chat = ?chat, message_id = ?message_id, %reason, "dropping malformed event");
                }
                // The committer already logged the dropped record.
                Err(err) => {
                    debug!(chat = ?chat, message_id = ?message_id, error = %err, "event not stored");
                }
            }
        }
        info!("event queue closed, pipeline drained");
    }
}

/// Re-queue downloads that were still pending when the process last stopped.
pub async fn resume_pending(storage: &dyn Storage, media: &MediaQueue) -> Result<usize> {
    let pending = storage.pending_media().await?;
    let count = pending.len();
    if count > 0 {
        info!(count, "resuming pending media downloads");
    }
    for reference in pending {
        media.enqueue(reference);
    }
    Ok(count)
}

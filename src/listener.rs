use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::IngestError;
use crate::transport::{RawEvent, Session};

/// Why [`EventListener::run`] returned.
#[derive(Debug)]
pub enum ListenerExit {
    /// Shutdown was requested or the pipeline went away
    Shutdown,
    /// The session failed; the connection manager decides what happens next
    Disconnected(IngestError),
}

enum Wake {
    Cancelled,
    KeepAlive,
    Event(crate::error::Result<Option<RawEvent>>),
}

/// Receives posts from a session and hands them to the pipeline queue.
///
/// Delivery is at-least-once: duplicates and out-of-order events are passed
/// through and deduplicated by the committer.
pub struct EventListener {
    channel: String,
    events: mpsc::Sender<RawEvent>,
    keepalive: Duration,
    last_seen: Option<i64>,
    /// Events handed to the pipeline during the current or last run
    delivered: u64,
}

impl EventListener {
    pub fn new(channel: &str, events: mpsc::Sender<RawEvent>, keepalive: Duration) -> Self {
        Self {
            channel: channel.trim().trim_start_matches('@').to_string(),
            events,
            keepalive: keepalive.max(Duration::from_secs(1)),
            last_seen: None,
            delivered: 0,
        }
    }

    /// Events forwarded by the most recent [`run`](Self::run).
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Whether `raw` belongs to the configured channel. Events with no
    /// channel at all are let through so the normalizer can reject and log
    /// them.
    fn is_target(&self, raw: &RawEvent) -> bool {
        let by_name = raw.chat_username.as_deref().map(|name| {
            name.trim_start_matches('@')
                .eq_ignore_ascii_case(&self.channel)
        });
        let by_id = raw.chat_id.map(|id| id.to_string() == self.channel);

        match (by_name, by_id) {
            (None, None) => true,
            (name, id) => name.unwrap_or(false) || id.unwrap_or(false),
        }
    }

    /// Pump events from `session` until shutdown or a session failure.
    /// Waits indefinitely for the next event.
    pub async fn run(
        &mut self,
        session: &mut dyn Session,
        cancel: &CancellationToken,
    ) -> ListenerExit {
        let mut keepalive = tokio::time::interval(self.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        keepalive.tick().await;
        self.delivered = 0;

        info!(channel = %self.channel, "listening for new messages");

        loop {
            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = keepalive.tick() => Wake::KeepAlive,
                next = session.next_event() => Wake::Event(next),
            };

            match wake {
                Wake::Cancelled => {
                    info!(channel = %self.channel, "listener stopping, no longer accepting events");
                    return ListenerExit::Shutdown;
                }
                Wake::KeepAlive => {
                    if let Err(e) = session.keep_alive().await {
                        return ListenerExit::Disconnected(e);
                    }
                    debug!(channel = %self.channel, "keep-alive ok");
                }
                Wake::Event(Ok(Some(raw))) => {
                    if !self.forward(raw).await {
                        return ListenerExit::Shutdown;
                    }
                }
                Wake::Event(Ok(None)) => {
                    return ListenerExit::Disconnected(IngestError::transport(
                        "session closed by provider",
                    ));
                }
                Wake::Event(Err(e)) => return ListenerExit::Disconnected(e),
            }
        }
    }

    /// Returns `false` once the pipeline queue is closed.
    async fn forward(&mut self, raw: RawEvent) -> bool {
        if !self.is_target(&raw) {
            debug!(
                chat_id = ?raw.chat_id,
                chat_username = ?raw.chat_username,
                "ignoring event from another channel"
            );
            return true;
        }

        if let Some(message_id) = raw.message_id {
            match self.last_seen {
                Some(last) if message_id <= last => {
                    debug!(
                        channel = %self.channel,
                        message_id,
                        last_seen = last,
                        "redelivered or out-of-order event"
                    );
                }
                _ => self.last_seen = Some(message_id),
            }
        }

        let message_id = raw.message_id;
        if self.events.send(raw).await.is_err() {
            error!(
                channel = %self.channel,
                message_id = ?message_id,
                "pipeline queue closed, event not handed off"
            );
            return false;
        }
        self.delivered += 1;
        true
    }
}

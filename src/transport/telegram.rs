use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate, FileId, FileMeta, Recipient, UpdateKind};
use teloxide::{ApiError, RequestError};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{Connector, Credentials, MediaSource, RawEvent, RawMedia, Session};
use crate::config::ProxySettings;
use crate::error::{IngestError, Result};

/// Long-poll timeout passed to getUpdates, in seconds
const POLL_TIMEOUT_SECS: u32 = 30;

/// Build a bot whose HTTP client goes through `proxy` when one is set.
/// The client timeout must outlast the long-poll timeout.
pub fn build_bot(credentials: &Credentials, proxy: Option<&ProxySettings>) -> Result<Bot> {
    let mut builder =
        teloxide::net::default_reqwest_settings().timeout(Duration::from_secs(45));

    if let Some(proxy) = proxy {
        let url = proxy.url();
        let proxy = reqwest::Proxy::all(&url)
            .map_err(|e| IngestError::config(format!("invalid proxy {}: {}", url, e)))?;
        builder = builder.proxy(proxy);
    }

    let client = builder
        .build()
        .map_err(|e| IngestError::transport(format!("failed to build HTTP client: {}", e)))?;

    Ok(Bot::with_client(&credentials.bot_token, client))
}

fn classify(err: RequestError) -> IngestError {
    match err {
        RequestError::RetryAfter(wait) => IngestError::RateLimited {
            retry_after: wait.duration(),
        },
        RequestError::Api(ApiError::InvalidToken) => {
            IngestError::Auth("bot token rejected by Telegram".to_string())
        }
        RequestError::Api(ApiError::Unknown(ref message)) if message.contains("Unauthorized") => {
            IngestError::Auth(message.clone())
        }
        other => IngestError::transport(other.to_string()),
    }
}

fn channel_recipient(channel: &str) -> Recipient {
    let channel = channel.trim();
    match channel.parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) if channel.starts_with('@') => Recipient::ChannelUsername(channel.to_string()),
        Err(_) => Recipient::ChannelUsername(format!("@{}", channel)),
    }
}

/// Connects through the Bot API. The bot must administer the channel to
/// receive its posts.
pub struct TelegramConnector;

#[async_trait]
impl Connector for TelegramConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
        proxy: Option<&ProxySettings>,
        channel: &str,
    ) -> Result<Box<dyn Session>> {
        let bot = build_bot(credentials, proxy)?;

        let me = bot.get_me().await.map_err(classify)?;

        // getUpdates is refused while a webhook is set
        bot.delete_webhook().await.map_err(classify)?;

        let chat = bot
            .get_chat(channel_recipient(channel))
            .await
            .map_err(|e| match e {
                RequestError::Api(ApiError::ChatNotFound) => {
                    IngestError::config(format!("channel {} not found", channel))
                }
                other => classify(other),
            })?;

        info!(
            bot = ?me.user.username,
            channel,
            chat_id = chat.id.0,
            "telegram session established"
        );

        Ok(Box::new(TelegramSession {
            bot,
            chat_id: chat.id,
            offset: 0,
            delivered: None,
            buffered: VecDeque::new(),
        }))
    }
}

pub struct TelegramSession {
    bot: Bot,
    chat_id: ChatId,
    /// Next getUpdates offset
    offset: i32,
    /// Offset that confirms every event handed out so far
    delivered: Option<i32>,
    buffered: VecDeque<(i32, RawEvent)>,
}

#[async_trait]
impl Session for TelegramSession {
    async fn next_event(&mut self) -> Result<Option<RawEvent>> {
        loop {
            if let Some((confirm, event)) = self.buffered.pop_front() {
                self.delivered = Some(confirm);
                return Ok(Some(event));
            }

            // Nothing below the await mutates state, so dropping this future
            // mid-poll loses no updates.
            let updates = self
                .bot
                .get_updates()
                .offset(self.offset)
                .timeout(POLL_TIMEOUT_SECS)
                .allowed_updates(vec![AllowedUpdate::ChannelPost])
                .await
                .map_err(classify)?;

            for update in updates {
                let confirm = update.id.as_offset();
                self.offset = confirm;
                match update.kind {
                    UpdateKind::ChannelPost(msg) if msg.chat.id == self.chat_id => {
                        self.buffered.push_back((confirm, raw_event_from_message(&msg)));
                    }
                    UpdateKind::ChannelPost(msg) => {
                        debug!(chat_id = msg.chat.id.0, "ignoring post from another channel");
                    }
                    other => {
                        debug!("ignoring non-channel update: {other:?}");
                    }
                }
            }
        }
    }

    async fn keep_alive(&mut self) -> Result<()> {
        self.bot.get_me().await.map_err(classify)?;
        Ok(())
    }

    async fn disconnect(&mut self) {
        // Acknowledge what was handed out so a restart does not see it again.
        // Buffered but undelivered updates stay unconfirmed.
        if let Some(confirm) = self.delivered {
            if let Err(e) = self
                .bot
                .get_updates()
                .offset(confirm)
                .timeout(0)
                .limit(1)
                .allowed_updates(vec![AllowedUpdate::ChannelPost])
                .await
            {
                warn!(error = %e, "failed to confirm delivered updates on disconnect");
            }
        }
        info!(chat_id = self.chat_id.0, "telegram session closed");
    }
}

fn raw_media(type_tag: &str, file: &FileMeta) -> RawMedia {
    RawMedia {
        type_tag: type_tag.to_string(),
        file_id: file.id.to_string(),
    }
}

/// Flatten a Bot API message into a [`RawEvent`].
pub fn raw_event_from_message(msg: &Message) -> RawEvent {
    let mut media = Vec::new();

    // Telegram sends every resolution of a photo; the last one is the largest.
    if let Some(largest) = msg.photo().and_then(|sizes| sizes.last()) {
        media.push(raw_media("photo", &largest.file));
    }
    if let Some(document) = msg.document() {
        media.push(raw_media("document", &document.file));
    }
    if let Some(video) = msg.video() {
        media.push(raw_media("video", &video.file));
    }
    if let Some(note) = msg.video_note() {
        media.push(raw_media("video_note", &note.file));
    }
    if let Some(animation) = msg.animation() {
        media.push(raw_media("animation", &animation.file));
    }
    if let Some(audio) = msg.audio() {
        media.push(raw_media("audio", &audio.file));
    }
    if let Some(voice) = msg.voice() {
        media.push(raw_media("voice", &voice.file));
    }
    if let Some(sticker) = msg.sticker() {
        media.push(raw_media("sticker", &sticker.file));
    }

    RawEvent {
        chat_id: Some(msg.chat.id.0),
        chat_username: msg.chat.username().map(str::to_string),
        message_id: Some(i64::from(msg.id.0)),
        date: Some(msg.date.timestamp()),
        text: msg.text().map(str::to_string),
        caption: msg.caption().map(str::to_string),
        media,
    }
}

/// Downloads attachments through the Bot API file endpoint.
pub struct TelegramMediaSource {
    bot: Bot,
}

impl TelegramMediaSource {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl MediaSource for TelegramMediaSource {
    async fn download(&self, remote_id: &str, dest: &Path) -> Result<u64> {
        let file = self
            .bot
            .get_file(FileId(remote_id.to_string()))
            .await
            .map_err(|e| match classify(e) {
                IngestError::Transport(message) => {
                    IngestError::download(format!("getFile failed: {}", message))
                }
                other => other,
            })?;

        let mut out = tokio::fs::File::create(dest).await?;
        self.bot
            .download_file(&file.path, &mut out)
            .await
            .map_err(|e| IngestError::download(e.to_string()))?;
        out.flush().await?;

        Ok(u64::from(file.meta.size))
    }
}

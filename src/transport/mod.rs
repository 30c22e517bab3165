pub mod telegram;

use std::path::Path;

use async_trait::async_trait;

use crate::config::ProxySettings;
use crate::error::Result;

/// One attachment as the provider described it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMedia {
    /// Provider type tag, e.g. "photo", "document", "voice"
    pub type_tag: String,
    pub file_id: String,
}

/// A new-message notification before normalization.
///
/// Every field is optional because the provider does not guarantee them;
/// the normalizer decides what is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    pub chat_id: Option<i64>,
    pub chat_username: Option<String>,
    pub message_id: Option<i64>,
    /// Unix seconds
    pub date: Option<i64>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub media: Vec<RawMedia>,
}

#[derive(Clone)]
pub struct Credentials {
    pub bot_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credentials(<redacted>)")
    }
}

/// A live, subscribed connection to the channel provider.
#[async_trait]
pub trait Session: Send {
    /// Wait for the next message posted to the subscribed channel.
    /// `Ok(None)` means the provider closed the session.
    ///
    /// Must be cancel-safe: dropping the future before it resolves must not
    /// lose an event.
    async fn next_event(&mut self) -> Result<Option<RawEvent>>;

    async fn keep_alive(&mut self) -> Result<()>;

    async fn disconnect(&mut self);
}

/// Opens sessions. Implementations map bad credentials to
/// `IngestError::Auth` and network trouble to `IngestError::Transport`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        credentials: &Credentials,
        proxy: Option<&ProxySettings>,
        channel: &str,
    ) -> Result<Box<dyn Session>>;
}

/// Downloads attachment payloads.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Write the payload identified by `remote_id` to `dest`, returning the
    /// number of bytes written.
    async fn download(&self, remote_id: &str, dest: &Path) -> Result<u64>;
}

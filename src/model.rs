use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Attachment category, inferred from the provider's type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Document,
    Video,
    Other,
}

impl MediaKind {
    pub fn from_type_tag(tag: &str) -> Self {
        match tag {
            "photo" => MediaKind::Photo,
            "document" => MediaKind::Document,
            "video" | "video_note" | "animation" => MediaKind::Video,
            _ => MediaKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Document => "document",
            MediaKind::Video => "video",
            MediaKind::Other => "other",
        }
    }

    /// File extension used for the local copy.
    pub fn extension(&self) -> &'static str {
        match self {
            MediaKind::Photo => "jpg",
            MediaKind::Video => "mp4",
            MediaKind::Document | MediaKind::Other => "bin",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStatus {
    Pending,
    Fetched,
    Failed,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::Pending => "pending",
            MediaStatus::Fetched => "fetched",
            MediaStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MediaStatus::Pending),
            "fetched" => Some(MediaStatus::Fetched),
            "failed" => Some(MediaStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attachment of a message and its download state.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaReference {
    pub channel_id: String,
    pub message_id: i64,
    /// Position within the owning message, starting at 0
    pub sequence: u32,
    pub kind: MediaKind,
    /// Provider handle used to download the payload
    pub remote_id: String,
    /// Set only once the payload is on disk
    pub local_path: Option<PathBuf>,
    pub status: MediaStatus,
}

impl MediaReference {
    pub fn pending(
        channel_id: &str,
        message_id: i64,
        sequence: u32,
        kind: MediaKind,
        remote_id: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            message_id,
            sequence,
            kind,
            remote_id: remote_id.into(),
            local_path: None,
            status: MediaStatus::Pending,
        }
    }

    pub fn fetched(mut self, path: PathBuf) -> Self {
        self.local_path = Some(path);
        self.status = MediaStatus::Fetched;
        self
    }

    pub fn failed(mut self) -> Self {
        self.local_path = None;
        self.status = MediaStatus::Failed;
        self
    }
}

/// Optional structured fields found in resource-sharing posts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostDetails {
    pub name: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub file_size: Option<String>,
    pub tags: Option<String>,
}

/// Canonical, storage-ready form of one channel message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub channel_id: String,
    pub message_id: i64,
    pub text: String,
    pub media_refs: Vec<MediaReference>,
    pub received_at: DateTime<Utc>,
    pub sent_at: DateTime<Utc>,
    pub details: PostDetails,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    Inserted,
    AlreadyExists,
}

use std::sync::LazyLock;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use tracing::warn;

use crate::error::{IngestError, Result};
use crate::model::{MediaKind, MediaReference, MessageRecord, PostDetails};
use crate::transport::RawEvent;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"名称：(.+)").unwrap());
static DESCRIPTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"描述：(.+)").unwrap());
static FILE_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"📁 大小：(.+)").unwrap());
static TAGS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"🏷 标签：(.+)").unwrap());
static QUARK_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://pan\.quark\.cn/s/[a-zA-Z0-9]+").unwrap());

/// Map a raw provider event to the canonical record.
///
/// The channel is identified by its public username when the provider
/// supplies one, otherwise by its numeric id. A missing channel or message
/// id is a [`IngestError::MalformedEvent`].
pub fn normalize(raw: &RawEvent, received_at: DateTime<Utc>) -> Result<MessageRecord> {
    let channel_id = raw
        .chat_username
        .as_deref()
        .map(|name| name.trim().trim_start_matches('@'))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .or_else(|| raw.chat_id.map(|id| id.to_string()))
        .ok_or_else(|| IngestError::malformed("event has no channel id"))?;

    let message_id = raw.message_id.ok_or_else(|| {
        IngestError::malformed(format!("event from channel {} has no message id", channel_id))
    })?;

    // Media posts carry their text in the caption.
    let text = raw
        .text
        .clone()
        .or_else(|| raw.caption.clone())
        .unwrap_or_default();

    let sent_at = match raw.date.and_then(|secs| Utc.timestamp_opt(secs, 0).single()) {
        Some(sent_at) => sent_at,
        None => {
            warn!(
                channel_id = %channel_id,
                message_id,
                "event has no usable send time, using capture time"
            );
            received_at
        }
    };

    let media_refs = raw
        .media
        .iter()
        .enumerate()
        .map(|(sequence, media)| {
            MediaReference::pending(
                &channel_id,
                message_id,
                sequence as u32,
                MediaKind::from_type_tag(&media.type_tag),
                media.file_id.clone(),
            )
        })
        .collect();

    let details = extract_details(&text);

    Ok(MessageRecord {
        channel_id,
        message_id,
        text,
        media_refs,
        received_at,
        sent_at,
        details,
    })
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Pull the labelled fields out of a resource-sharing post.
pub fn extract_details(text: &str) -> PostDetails {
    PostDetails {
        name: capture(&NAME_RE, text),
        description: capture(&DESCRIPTION_RE, text),
        link: QUARK_LINK_RE.find(text).map(|m| m.as_str().to_string()),
        file_size: capture(&FILE_SIZE_RE, text),
        tags: capture(&TAGS_RE, text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaStatus;
    use crate::transport::testing::{event, photo_event};
    use crate::transport::RawMedia;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_500, 0).unwrap()
    }

    #[test]
    fn test_plain_text_event() {
        let record = normalize(&event("NewQuark", 101, "hello"), now()).unwrap();
        assert_eq!(record.channel_id, "NewQuark");
        assert_eq!(record.message_id, 101);
        assert_eq!(record.text, "hello");
        assert!(record.media_refs.is_empty());
        assert_eq!(record.sent_at, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        assert_eq!(record.received_at, now());
        assert_eq!(record.details, PostDetails::default());
    }

    #[test]
    fn test_missing_text_becomes_empty() {
        let mut raw = event("NewQuark", 5, "");
        raw.text = None;
        let record = normalize(&raw, now()).unwrap();
        assert_eq!(record.text, "");
    }

    #[test]
    fn test_caption_used_when_text_absent() {
        let mut raw = photo_event("NewQuark", 7, "file-a");
        raw.text = None;
        raw.caption = Some("look".to_string());
        assert_eq!(normalize(&raw, now()).unwrap().text, "look");
    }

    #[test]
    fn test_username_preferred_over_numeric_id() {
        let mut raw = event("@NewQuark", 1, "x");
        raw.chat_id = Some(-100123);
        assert_eq!(normalize(&raw, now()).unwrap().channel_id, "NewQuark");

        raw.chat_username = None;
        assert_eq!(normalize(&raw, now()).unwrap().channel_id, "-100123");
    }

    #[test]
    fn test_missing_ids_are_malformed() {
        let mut no_message = event("NewQuark", 1, "x");
        no_message.message_id = None;
        assert!(matches!(
            normalize(&no_message, now()),
            Err(IngestError::MalformedEvent(_))
        ));

        let mut no_channel = event("NewQuark", 1, "x");
        no_channel.chat_username = None;
        no_channel.chat_id = None;
        assert!(matches!(
            normalize(&no_channel, now()),
            Err(IngestError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_bare_at_sign_is_not_a_channel_name() {
        let mut bare = event("@", 1, "x");
        bare.chat_id = None;
        assert!(matches!(
            normalize(&bare, now()),
            Err(IngestError::MalformedEvent(_))
        ));

        bare.chat_id = Some(-1001234567890);
        let record = normalize(&bare, now()).unwrap();
        assert_eq!(record.channel_id, "-1001234567890");
    }

    #[test]
    fn test_missing_date_falls_back_to_capture_time() {
        let mut raw = event("NewQuark", 9, "x");
        raw.date = None;
        assert_eq!(normalize(&raw, now()).unwrap().sent_at, now());
    }

    #[test]
    fn test_one_pending_reference_per_attachment() {
        let mut raw = event("NewQuark", 200, "album");
        raw.media = ["photo", "document", "video", "voice", "sticker"]
            .iter()
            .enumerate()
            .map(|(i, tag)| RawMedia {
                type_tag: tag.to_string(),
                file_id: format!("file-{}", i),
            })
            .collect();

        let record = normalize(&raw, now()).unwrap();
        assert_eq!(record.media_refs.len(), 5);

        let kinds: Vec<MediaKind> = record.media_refs.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MediaKind::Photo,
                MediaKind::Document,
                MediaKind::Video,
                MediaKind::Other,
                MediaKind::Other,
            ]
        );
        for (i, media) in record.media_refs.iter().enumerate() {
            assert_eq!(media.sequence, i as u32);
            assert_eq!(media.message_id, 200);
            assert_eq!(media.channel_id, "NewQuark");
            assert_eq!(media.status, MediaStatus::Pending);
            assert_eq!(media.local_path, None);
        }
    }

    #[test]
    fn test_extract_details_from_resource_post() {
        let text = "名称：Rust 程序设计\n\n描述：一本关于 Rust 的书\n\n链接：https://pan.quark.cn/s/abc123XYZ\n\n📁 大小：1.2 GB\n🏷 标签：#编程 #Rust";
        let details = extract_details(text);
        assert_eq!(details.name.as_deref(), Some("Rust 程序设计"));
        assert_eq!(details.description.as_deref(), Some("一本关于 Rust 的书"));
        assert_eq!(details.link.as_deref(), Some("https://pan.quark.cn/s/abc123XYZ"));
        assert_eq!(details.file_size.as_deref(), Some("1.2 GB"));
        assert_eq!(details.tags.as_deref(), Some("#编程 #Rust"));
    }

    #[test]
    fn test_extract_details_absent_markers() {
        assert_eq!(extract_details("just chatting"), PostDetails::default());
    }
}

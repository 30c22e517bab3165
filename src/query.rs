use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

use crate::error::{IngestError, Result};
use crate::model::MessageRecord;
use crate::store::Storage;

fn parse_day(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|e| {
        IngestError::config(format!("'{}' is not a YYYY-MM-DD date: {}", value, e))
    })
}

/// Whole UTC days from the start of `start` to the last microsecond of `end`.
pub fn day_range(start: &str, end: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let first = parse_day(start)?;
    let last = parse_day(end)?;
    if last < first {
        return Err(IngestError::config(format!(
            "end date {} is before start date {}",
            last, first
        )));
    }

    let from = first
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| IngestError::config("start of day out of range"))?
        .and_utc();
    let to = last
        .and_hms_micro_opt(23, 59, 59, 999_999)
        .ok_or_else(|| IngestError::config("end of day out of range"))?
        .and_utc();
    Ok((from, to))
}

/// One tab-separated line per message; the text is flattened to one line.
pub fn format_row(record: &MessageRecord) -> String {
    let text = record.text.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        record.sent_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        record.channel_id,
        record.message_id,
        record.details.name.as_deref().unwrap_or("-"),
        record.details.link.as_deref().unwrap_or("-"),
        record.media_refs.len(),
        text
    )
}

/// Messages sent between the two days, inclusive, newest first.
pub async fn messages_between(
    storage: &dyn Storage,
    start: &str,
    end: &str,
) -> Result<Vec<MessageRecord>> {
    let (from, to) = day_range(start, end)?;
    storage.query_messages(from, to).await
}

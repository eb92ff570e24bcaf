//! Normalized records handed to the application.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

/// A message received from a room, live or from the archive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub from: String,
    pub to: String,
    pub body: String,
    pub mention_name: String,
    /// Server delay stamp, or the receipt time when the stamp is absent or unparsable.
    pub timestamp: DateTime<Utc>,
    pub id: String,
    pub attachments: Vec<Attachment>,
}

/// An inline image carried in the rich-text body of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub image_url: String,
    pub image_filename: String,
    pub thumbnail_size: String,
    pub thumbnail_url: String,
}

/// A member of the chat service, from a roster query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub mention_name: String,
}

/// A group-chat room, from a directory query or an invitation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Room {
    pub id: String,
    pub display_name: String,
    pub owner: String,
    pub topic: String,
}

/// Parse a server delay stamp, falling back to `now` on failure.
///
/// Servers send `2006-01-02T15:04:05Z`; fractional seconds and offsets
/// are accepted through RFC 3339.
pub fn parse_stamp(stamp: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    if stamp.is_empty() {
        return now;
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%dT%H:%M:%SZ") {
        return naive.and_utc();
    }
    DateTime::parse_from_rfc3339(stamp)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now)
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One folder as reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderRecord {
    pub id: String,
    pub display_name: String,
    pub parent_id: Option<String>,
    pub child_folder_count: u32,
    pub total_item_count: u64,
    pub unread_item_count: u64,
    pub is_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageSummary {
    pub id: String,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub has_attachments: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    File,
    Item,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRecord {
    pub message_id: String,
    pub attachment_id: String,
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub size: u64,
    pub is_inline: bool,
    pub kind: AttachmentKind,
}

/// Filter and page shape for a message listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub folder_id: String,
    pub received_since: Option<DateTime<Utc>>,
    pub unread_only: bool,
    pub has_attachments_only: bool,
    pub page_size: usize,
}

/// One page of a listing. `next_cursor` is opaque to callers.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Draft {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub body_content_type: String,
}

// Wire records. Everything is optional here so that missing fields surface
// as `Error::Malformed` from the conversions below instead of serde errors.

#[derive(Debug, Deserialize)]
pub(crate) struct WirePage<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireFolder {
    pub id: Option<String>,
    pub display_name: Option<String>,
    pub parent_folder_id: Option<String>,
    pub child_folder_count: Option<i64>,
    pub total_item_count: Option<i64>,
    pub unread_item_count: Option<i64>,
    pub is_hidden: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireEmailAddress {
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireRecipient {
    pub email_address: Option<WireEmailAddress>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireMessage {
    pub id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<WireRecipient>,
    pub received_date_time: Option<String>,
    pub is_read: Option<bool>,
    pub has_attachments: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireAttachment {
    #[serde(rename = "@odata.type")]
    pub odata_type: Option<String>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub size: Option<i64>,
    pub is_inline: Option<bool>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn count(value: Option<i64>) -> u64 {
    value.unwrap_or(0).max(0) as u64
}

/// Parse a remote timestamp such as `2024-03-01T10:15:00Z`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl TryFrom<WireFolder> for FolderRecord {
    type Error = Error;

    fn try_from(wire: WireFolder) -> Result<Self> {
        let id = non_empty(wire.id).ok_or_else(|| Error::malformed("folder", "missing id"))?;
        let display_name = non_empty(wire.display_name).unwrap_or_else(|| id.clone());
        Ok(FolderRecord {
            display_name,
            parent_id: non_empty(wire.parent_folder_id),
            child_folder_count: u32::try_from(count(wire.child_folder_count))
                .unwrap_or(u32::MAX),
            total_item_count: count(wire.total_item_count),
            unread_item_count: count(wire.unread_item_count),
            is_hidden: wire.is_hidden.unwrap_or(false),
            id,
        })
    }
}

impl TryFrom<WireMessage> for MessageSummary {
    type Error = Error;

    fn try_from(wire: WireMessage) -> Result<Self> {
        let id = non_empty(wire.id).ok_or_else(|| Error::malformed("message", "missing id"))?;
        let raw_received = wire.received_date_time.ok_or_else(|| {
            Error::malformed("message", format!("message {} has no receivedDateTime", id))
        })?;
        let received_at = parse_timestamp(&raw_received).ok_or_else(|| {
            Error::malformed(
                "message",
                format!("message {} has unparsable receivedDateTime '{}'", id, raw_received),
            )
        })?;
        let from = wire
            .from
            .and_then(|r| r.email_address)
            .and_then(|a| non_empty(a.address).or_else(|| non_empty(a.name)));

        Ok(MessageSummary {
            id,
            subject: wire.subject,
            from,
            received_at,
            is_read: wire.is_read.unwrap_or(false),
            has_attachments: wire.has_attachments.unwrap_or(false),
        })
    }
}

impl AttachmentRecord {
    pub(crate) fn from_wire(message_id: &str, wire: WireAttachment) -> Result<Self> {
        let attachment_id = non_empty(wire.id).ok_or_else(|| {
            Error::malformed(
                "attachment",
                format!("attachment without id on message {}", message_id),
            )
        })?;
        let kind = match wire.odata_type.as_deref() {
            Some("#microsoft.graph.itemAttachment") => AttachmentKind::Item,
            Some("#microsoft.graph.referenceAttachment") => AttachmentKind::Reference,
            _ => AttachmentKind::File,
        };
        Ok(AttachmentRecord {
            message_id: message_id.to_string(),
            attachment_id,
            name: non_empty(wire.name),
            content_type: non_empty(wire.content_type),
            size: count(wire.size),
            is_inline: wire.is_inline.unwrap_or(false),
            kind,
        })
    }
}

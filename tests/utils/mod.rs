#![allow(dead_code)]

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use mail_agent::error::{Error, RemoteErrorKind};
use mail_agent::folders::FolderSelector;
use mail_agent::graph::{
    AttachmentKind, AttachmentRecord, Draft, FolderRecord, MailStore, MessageQuery,
    MessageSummary, Page,
};
use mail_agent::sync::{Clock, DownloadNewOptions, DownloadRecentOptions};
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process;

pub const INBOX_ID: &str = "inbox-id";

pub fn at(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("test timestamp")
        .with_timezone(&Utc)
}

pub fn now() -> DateTime<Utc> {
    at("2024-05-20T12:00:00Z")
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    now() - Duration::hours(hours)
}

pub fn days_ago(days: i64) -> DateTime<Utc> {
    now() - Duration::days(days)
}

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub fn transient() -> Error {
    Error::Remote {
        status: 503,
        kind: RemoteErrorKind::Transient,
        message: "service unavailable".to_string(),
    }
}

pub fn gone() -> Error {
    Error::Remote {
        status: 404,
        kind: RemoteErrorKind::Permanent,
        message: "ErrorItemNotFound".to_string(),
    }
}

struct StoredAttachment {
    record: AttachmentRecord,
    bytes: Vec<u8>,
}

/// In-memory mailbox. Everything is keyed by id; folder `inbox` is the
/// well-known root.
pub struct FakeMailStore {
    folders: RefCell<HashMap<String, FolderRecord>>,
    children: RefCell<HashMap<String, Vec<String>>>,
    messages: RefCell<Vec<(String, MessageSummary)>>,
    attachments: RefCell<HashMap<String, Vec<StoredAttachment>>>,
    failures: RefCell<HashMap<String, VecDeque<Error>>>,
    page_failures: RefCell<VecDeque<Error>>,
    page_limit: Cell<Option<usize>>,
    pub content_calls: RefCell<Vec<String>>,
    pub queries: RefCell<Vec<MessageQuery>>,
    pub folder_calls: Cell<usize>,
}

impl FakeMailStore {
    pub fn new() -> Self {
        let store = FakeMailStore {
            folders: RefCell::new(HashMap::new()),
            children: RefCell::new(HashMap::new()),
            messages: RefCell::new(Vec::new()),
            attachments: RefCell::new(HashMap::new()),
            failures: RefCell::new(HashMap::new()),
            page_failures: RefCell::new(VecDeque::new()),
            page_limit: Cell::new(None),
            content_calls: RefCell::new(Vec::new()),
            queries: RefCell::new(Vec::new()),
            folder_calls: Cell::new(0),
        };
        store.folders.borrow_mut().insert(
            INBOX_ID.to_string(),
            folder_record(INBOX_ID, "Inbox", None, false),
        );
        store
    }

    pub fn add_folder(&self, parent_id: &str, id: &str, name: &str) -> &Self {
        self.insert_folder(parent_id, id, name, false)
    }

    pub fn add_hidden_folder(&self, parent_id: &str, id: &str, name: &str) -> &Self {
        self.insert_folder(parent_id, id, name, true)
    }

    fn insert_folder(&self, parent_id: &str, id: &str, name: &str, hidden: bool) -> &Self {
        let mut folders = self.folders.borrow_mut();
        folders.insert(id.to_string(), folder_record(id, name, Some(parent_id), hidden));
        if let Some(parent) = folders.get_mut(parent_id) {
            parent.child_folder_count += 1;
        }
        self.children
            .borrow_mut()
            .entry(parent_id.to_string())
            .or_default()
            .push(id.to_string());
        self
    }

    pub fn add_message(
        &self,
        folder_id: &str,
        id: &str,
        subject: &str,
        received_at: DateTime<Utc>,
        is_read: bool,
    ) -> &Self {
        self.messages.borrow_mut().push((
            folder_id.to_string(),
            MessageSummary {
                id: id.to_string(),
                subject: Some(subject.to_string()),
                from: Some("sender@example.com".to_string()),
                received_at,
                is_read,
                has_attachments: false,
            },
        ));
        self
    }

    pub fn add_attachment(&self, message_id: &str, attachment_id: &str, name: &str, bytes: &[u8]) -> &Self {
        self.insert_attachment(message_id, attachment_id, name, bytes, false)
    }

    pub fn add_inline_attachment(&self, message_id: &str, attachment_id: &str, name: &str) -> &Self {
        self.insert_attachment(message_id, attachment_id, name, b"inline", true)
    }

    fn insert_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
        name: &str,
        bytes: &[u8],
        is_inline: bool,
    ) -> &Self {
        for (_, message) in self.messages.borrow_mut().iter_mut() {
            if message.id == message_id {
                message.has_attachments = true;
            }
        }
        self.attachments
            .borrow_mut()
            .entry(message_id.to_string())
            .or_default()
            .push(StoredAttachment {
                record: AttachmentRecord {
                    message_id: message_id.to_string(),
                    attachment_id: attachment_id.to_string(),
                    name: Some(name.to_string()),
                    content_type: Some("application/octet-stream".to_string()),
                    size: bytes.len() as u64,
                    is_inline,
                    kind: AttachmentKind::File,
                },
                bytes: bytes.to_vec(),
            });
        self
    }

    /// The next `errors.len()` content downloads of this attachment fail.
    pub fn fail_content(&self, message_id: &str, attachment_id: &str, errors: Vec<Error>) {
        self.failures
            .borrow_mut()
            .insert(format!("content:{}:{}", message_id, attachment_id), errors.into());
    }

    pub fn fail_listing(&self, message_id: &str, errors: Vec<Error>) {
        self.failures
            .borrow_mut()
            .insert(format!("list:{}", message_id), errors.into());
    }

    pub fn fail_pages(&self, errors: Vec<Error>) {
        *self.page_failures.borrow_mut() = errors.into();
    }

    /// Serve at most `limit` messages per page, whatever the query asks for.
    pub fn limit_pages_to(&self, limit: usize) {
        self.page_limit.set(Some(limit));
    }

    pub fn content_calls_for(&self, message_id: &str, attachment_id: &str) -> usize {
        let key = format!("{}:{}", message_id, attachment_id);
        self.content_calls
            .borrow()
            .iter()
            .filter(|k| **k == key)
            .count()
    }

    fn take_failure(&self, key: &str) -> Option<Error> {
        self.failures
            .borrow_mut()
            .get_mut(key)
            .and_then(|queue| queue.pop_front())
    }

    fn stored<T>(&self, message_id: &str, f: impl Fn(&[StoredAttachment]) -> T) -> Option<T> {
        self.attachments.borrow().get(message_id).map(|a| f(a.as_slice()))
    }
}

fn folder_record(id: &str, name: &str, parent_id: Option<&str>, hidden: bool) -> FolderRecord {
    FolderRecord {
        id: id.to_string(),
        display_name: name.to_string(),
        parent_id: parent_id.map(str::to_string),
        child_folder_count: 0,
        total_item_count: 0,
        unread_item_count: 0,
        is_hidden: hidden,
    }
}

fn not_found(what: &str) -> Error {
    Error::Remote {
        status: 404,
        kind: RemoteErrorKind::Permanent,
        message: format!("{} not found", what),
    }
}

impl MailStore for FakeMailStore {
    fn get_folder(&self, folder: &str) -> mail_agent::Result<FolderRecord> {
        self.folder_calls.set(self.folder_calls.get() + 1);
        let id = if folder.eq_ignore_ascii_case("inbox") { INBOX_ID } else { folder };
        self.folders
            .borrow()
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(folder))
    }

    fn list_child_folders(
        &self,
        folder_id: &str,
        include_hidden: bool,
    ) -> mail_agent::Result<Vec<FolderRecord>> {
        let folders = self.folders.borrow();
        Ok(self
            .children
            .borrow()
            .get(folder_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| folders.get(id))
                    .filter(|f| include_hidden || !f.is_hidden)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn list_messages(
        &self,
        query: &MessageQuery,
        cursor: Option<&str>,
    ) -> mail_agent::Result<Page<MessageSummary>> {
        self.queries.borrow_mut().push(query.clone());
        if let Some(error) = self.page_failures.borrow_mut().pop_front() {
            return Err(error);
        }

        let mut matching: Vec<MessageSummary> = self
            .messages
            .borrow()
            .iter()
            .filter(|(folder, _)| *folder == query.folder_id)
            .map(|(_, m)| m.clone())
            .filter(|m| query.received_since.map_or(true, |since| m.received_at >= since))
            .filter(|m| !query.unread_only || !m.is_read)
            .filter(|m| !query.has_attachments_only || m.has_attachments)
            .collect();
        matching.sort_by(|a, b| b.received_at.cmp(&a.received_at));

        let offset: usize = cursor.map(|c| c.parse().unwrap_or(0)).unwrap_or(0);
        let page_size = self
            .page_limit
            .get()
            .map_or(query.page_size, |limit| limit.min(query.page_size));
        let end = (offset + page_size.max(1)).min(matching.len());
        let items = matching[offset.min(end)..end].to_vec();
        let next_cursor = if end < matching.len() {
            Some(end.to_string())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    fn list_attachments(&self, message_id: &str) -> mail_agent::Result<Vec<AttachmentRecord>> {
        if let Some(error) = self.take_failure(&format!("list:{}", message_id)) {
            return Err(error);
        }
        Ok(self
            .stored(message_id, |a| a.iter().map(|s| s.record.clone()).collect())
            .unwrap_or_default())
    }

    fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> mail_agent::Result<AttachmentRecord> {
        self.stored(message_id, |a| {
            a.iter()
                .find(|s| s.record.attachment_id == attachment_id)
                .map(|s| s.record.clone())
        })
        .flatten()
        .ok_or_else(|| not_found(attachment_id))
    }

    fn attachment_content(&self, message_id: &str, attachment_id: &str) -> mail_agent::Result<Vec<u8>> {
        self.content_calls
            .borrow_mut()
            .push(format!("{}:{}", message_id, attachment_id));
        if let Some(error) = self.take_failure(&format!("content:{}:{}", message_id, attachment_id)) {
            return Err(error);
        }
        self.stored(message_id, |a| {
            a.iter()
                .find(|s| s.record.attachment_id == attachment_id)
                .map(|s| s.bytes.clone())
        })
        .flatten()
        .ok_or_else(|| not_found(attachment_id))
    }

    fn get_message(&self, message_id: &str) -> mail_agent::Result<Value> {
        Ok(json!({ "id": message_id }))
    }

    fn mark_message(&self, message_id: &str, read: bool) -> mail_agent::Result<Value> {
        for (_, message) in self.messages.borrow_mut().iter_mut() {
            if message.id == message_id {
                message.is_read = read;
            }
        }
        Ok(json!({ "id": message_id, "isRead": read }))
    }

    fn create_draft(&self, draft: &Draft) -> mail_agent::Result<Value> {
        Ok(json!({ "id": "draft-1", "subject": draft.subject }))
    }

    fn send_draft(&self, _message_id: &str) -> mail_agent::Result<()> {
        Ok(())
    }
}

pub fn new_options(output_dir: &Path) -> DownloadNewOptions {
    DownloadNewOptions {
        selector: FolderSelector::Token("inbox".to_string()),
        include_hidden: false,
        overlap_hours: 48,
        max_pages: 20,
        max_messages: 1000,
        include_inline: false,
        output_dir: output_dir.to_path_buf(),
    }
}

pub fn recent_options(output_dir: &Path, top: usize) -> DownloadRecentOptions {
    DownloadRecentOptions {
        selector: FolderSelector::Token("inbox".to_string()),
        include_hidden: false,
        top,
        unread_only: false,
        include_inline: false,
        output_dir: output_dir.to_path_buf(),
    }
}

/// Parse the JSON envelope a `mail-agent` invocation printed on stdout.
pub fn parse_output(output: process::Output) -> Result<(i32, Value)> {
    let stdout = String::from_utf8(output.stdout).context("Couldn't stringify stdout")?;
    let envelope: Value = serde_json::from_str(&stdout)
        .with_context(|| format!("stdout wasn't a JSON envelope:\n{}", stdout))?;
    Ok((output.status.code().unwrap_or(-1), envelope))
}

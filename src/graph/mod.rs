//! The remote mailbox service as the rest of the crate sees it.

pub mod client;
pub mod types;

pub use client::GraphClient;
pub use types::*;

use serde_json::Value;

use crate::error::Result;

/// Operations the sync core and the thin commands need from a mailbox.
///
/// Implementations parse remote payloads into the typed records at the
/// boundary; the single-message CRUD calls pass the remote JSON through.
pub trait MailStore {
    /// Look up a folder by id or well-known name (`inbox`, `sentitems`, ...).
    fn get_folder(&self, folder: &str) -> Result<FolderRecord>;

    fn list_child_folders(&self, folder_id: &str, include_hidden: bool)
        -> Result<Vec<FolderRecord>>;

    /// Fetch one page of messages, newest first. `cursor` is `None` for the
    /// first page and the previous page's `next_cursor` afterwards.
    fn list_messages(&self, query: &MessageQuery, cursor: Option<&str>)
        -> Result<Page<MessageSummary>>;

    fn list_attachments(&self, message_id: &str) -> Result<Vec<AttachmentRecord>>;

    fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<AttachmentRecord>;

    fn attachment_content(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>>;

    fn get_message(&self, message_id: &str) -> Result<Value>;

    fn mark_message(&self, message_id: &str, read: bool) -> Result<Value>;

    fn create_draft(&self, draft: &Draft) -> Result<Value>;

    fn send_draft(&self, message_id: &str) -> Result<()>;
}

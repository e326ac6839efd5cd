//! One-shot mailbox commands: message CRUD, folder listing and ad-hoc
//! attachment downloads. None of these touch the sync ledger.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::warn;

use crate::enumerate::{MessagePager, PageCaps, MAX_PAGE_SIZE};
use crate::error::{Error, Result};
use crate::fetcher::{ensure_output_dir, AttachmentFetcher};
use crate::folders::{self, FolderSelector};
use crate::graph::{Draft, MailStore};
use crate::ledger::FailureKind;

pub const BODY_CONTENT_TYPES: &[&str] = &["Text", "HTML"];

pub fn list_messages<S: MailStore + ?Sized>(
    store: &S,
    selector: &FolderSelector,
    include_hidden: bool,
    unread_only: bool,
    top: usize,
) -> Result<Value> {
    if top == 0 {
        return Err(Error::InvalidArgument("--top must be > 0".to_string()));
    }
    let folder = folders::resolve(store, selector, include_hidden)?;
    let pages = (top + MAX_PAGE_SIZE - 1) / MAX_PAGE_SIZE;
    let messages = MessagePager::new(store, &folder.resolved_folder_id, None, PageCaps::new(pages, top)?)
        .unread_only(unread_only)
        .collect::<Result<Vec<_>>>()?;

    Ok(json!({
        "folder": folder,
        "unread_only": unread_only,
        "top": top,
        "count": messages.len(),
        "messages": messages,
    }))
}

pub fn get_message<S: MailStore + ?Sized>(store: &S, message_id: &str) -> Result<Value> {
    Ok(json!({ "message": store.get_message(message_id)? }))
}

pub fn mark_message<S: MailStore + ?Sized>(store: &S, message_id: &str, read: &str) -> Result<Value> {
    let read = parse_boolean(read)?;
    let updated = store.mark_message(message_id, read)?;
    Ok(json!({
        "message_id": message_id,
        "read": read,
        "updated": updated,
    }))
}

pub fn create_draft<S: MailStore + ?Sized>(
    store: &S,
    to: &[String],
    subject: &str,
    body: &str,
    body_content_type: &str,
) -> Result<Value> {
    let content_type = BODY_CONTENT_TYPES
        .iter()
        .find(|t| t.eq_ignore_ascii_case(body_content_type))
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "--body-content-type must be one of: {}",
                BODY_CONTENT_TYPES.join(", ")
            ))
        })?;
    let draft = Draft {
        to: parse_recipients(to)?,
        subject: subject.to_string(),
        body: body.to_string(),
        body_content_type: content_type.to_string(),
    };
    let created = store.create_draft(&draft)?;
    Ok(json!({
        "message_id": created.get("id"),
        "subject": created.get("subject"),
        "to": draft.to,
        "is_draft": true,
        "web_link": created.get("webLink"),
    }))
}

/// Sending is gated; without `confirm` the store is never contacted.
pub fn send_draft<S: MailStore + ?Sized>(store: &S, message_id: &str, confirm: bool) -> Result<Value> {
    if !confirm {
        return Err(Error::ConfirmationRequired {
            action: "send-draft",
            flag: "--confirm-send",
        });
    }
    store.send_draft(message_id)?;
    Ok(json!({
        "message_id": message_id,
        "sent": true,
        "confirmation": "explicit",
    }))
}

pub fn folder_tree<S: MailStore + ?Sized>(
    store: &S,
    root: &str,
    include_hidden: bool,
    max_nodes: usize,
) -> Result<Value> {
    let root = match root.trim() {
        "" => folders::DEFAULT_FOLDER_ROOT,
        r => r,
    };
    let tree = folders::build_tree(store, root, include_hidden, max_nodes)?;
    Ok(json!({
        "root_token": root,
        "include_hidden": include_hidden,
        "max_nodes": max_nodes,
        "count": tree.len(),
        "tree": tree.nested(),
        "index": tree.index(),
    }))
}

pub fn list_attachments<S: MailStore + ?Sized>(store: &S, message_id: &str) -> Result<Value> {
    let attachments = store.list_attachments(message_id)?;
    Ok(json!({
        "message_id": message_id,
        "count": attachments.len(),
        "attachments": attachments,
    }))
}

pub fn download_attachment<S: MailStore + ?Sized>(
    store: &S,
    message_id: &str,
    attachment_id: &str,
    output_dir: &Path,
) -> Result<Value> {
    let target = ensure_output_dir(output_dir)?;
    let record = store.get_attachment(message_id, attachment_id)?;
    let written = AttachmentFetcher::new(store, true).fetch(&record, &target)?;
    Ok(serde_json::to_value(written)?)
}

/// Download every attachment of one message. Failures are reported per
/// attachment rather than failing the command.
pub fn download_all<S: MailStore + ?Sized>(
    store: &S,
    message_id: &str,
    output_dir: &Path,
    include_inline: bool,
) -> Result<Value> {
    let target = ensure_output_dir(output_dir)?;
    let fetcher = AttachmentFetcher::new(store, include_inline);
    let mut downloaded = Vec::new();
    let mut skipped = Vec::new();
    let mut failed = Vec::new();

    for record in store.list_attachments(message_id)? {
        if let Some(reason) = fetcher.skip_reason(&record) {
            skipped.push(json!({
                "attachment_id": record.attachment_id,
                "name": record.name,
                "reason": reason,
            }));
            continue;
        }
        match fetcher.fetch(&record, &target) {
            Ok(written) => downloaded.push(written),
            Err(e @ Error::ReauthRequired(_)) => return Err(e),
            Err(e) => {
                warn!(message_id, attachment_id = %record.attachment_id, "download failed: {}", e);
                failed.push(json!({
                    "attachment_id": record.attachment_id,
                    "name": record.name,
                    "kind": FailureKind::classify(&e),
                    "error": e.to_string(),
                }));
            }
        }
    }

    Ok(json!({
        "message_id": message_id,
        "output_dir": target,
        "downloaded_count": downloaded.len(),
        "skipped_count": skipped.len(),
        "failed_count": failed.len(),
        "downloaded": downloaded,
        "skipped": skipped,
        "failed": failed,
    }))
}

pub fn parse_boolean(raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Ok(true),
        "0" | "false" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidArgument(
            "--read must be one of: true, false".to_string(),
        )),
    }
}

/// Accepts repeated values as well as `;` or `,` separated lists.
pub fn parse_recipients(raw: &[String]) -> Result<Vec<String>> {
    let recipients: Vec<String> = raw
        .iter()
        .flat_map(|value| value.split(|c: char| c == ';' || c == ','))
        .map(str::trim)
        .filter(|email| !email.is_empty())
        .map(str::to_string)
        .collect();
    if recipients.is_empty() {
        return Err(Error::InvalidArgument(
            "at least one recipient is required".to_string(),
        ));
    }
    Ok(recipients)
}

pub fn read_body(body_file: Option<&PathBuf>, body: Option<&str>) -> Result<String> {
    match body_file {
        Some(path) => Ok(fs::read_to_string(path)?),
        None => Ok(body.unwrap_or_default().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booleans() {
        assert!(parse_boolean("Yes").unwrap());
        assert!(!parse_boolean(" 0 ").unwrap());
        assert!(parse_boolean("maybe").is_err());
    }

    #[test]
    fn recipients_are_split() {
        let raw = vec!["a@x.com; b@x.com".to_string(), "c@x.com,".to_string()];
        assert_eq!(
            parse_recipients(&raw).unwrap(),
            vec!["a@x.com", "b@x.com", "c@x.com"]
        );
        assert!(parse_recipients(&[" ; ".to_string()]).is_err());
    }
}

//! Attachment retrieval and safe placement on disk.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::{AttachmentKind, AttachmentRecord, MailStore, MessageSummary};
use crate::ledger::sha256_hex;

pub const FALLBACK_NAME: &str = "attachment.bin";
const MAX_NAME_CHARS: usize = 180;
const MAX_SUBJECT_CHARS: usize = 80;
const MAX_COLLISIONS: usize = 1000;
const RESERVED: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
const DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Make a remote supplied name safe to use as a single path component.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if c.is_control() || RESERVED.contains(&c) { '_' } else { c })
        .collect();
    let trimmed = replaced.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    let mut cleaned = trimmed.to_string();
    let stem = cleaned
        .split('.')
        .next()
        .unwrap_or_default()
        .trim()
        .to_uppercase();
    if DEVICE_NAMES.contains(&stem.as_str()) {
        cleaned.insert(0, '_');
    }
    truncate_keeping_extension(&cleaned, MAX_NAME_CHARS)
}

fn truncate_keeping_extension(name: &str, limit: usize) -> String {
    if name.chars().count() <= limit {
        return name.to_string();
    }
    let (stem, ext) = split_extension(name);
    let ext_len = ext.chars().count();
    if ext_len >= limit {
        return name.chars().take(limit).collect();
    }
    let mut out: String = stem.chars().take(limit - ext_len).collect();
    out.push_str(ext);
    out
}

/// `report.final.pdf` -> (`report.final`, `.pdf`).
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if i > 0 => name.split_at(i),
        _ => (name, ""),
    }
}

/// `<mode>_<YYYYmmddTHHMMSSZ>` below `parent`. Not created here.
pub fn batch_dir(parent: &Path, mode: &str, now: DateTime<Utc>) -> PathBuf {
    parent.join(format!("{}_{}", mode, now.format("%Y%m%dT%H%M%SZ")))
}

pub fn message_dir_name(message: &MessageSummary) -> String {
    let received = message.received_at.format("%Y%m%dT%H%M%SZ");
    let subject = message
        .subject
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            sanitize_filename(s)
                .chars()
                .take(MAX_SUBJECT_CHARS)
                .collect::<String>()
                .trim_matches(|c| c == ' ' || c == '_')
                .to_string()
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "no_subject".to_string());
    let mut id = sha256_hex(&message.id);
    id.truncate(12);
    format!("msg_{}_{}_{}", received, subject, id)
}

/// Create the output root, surfacing failures as configuration errors.
pub fn ensure_output_dir(path: &Path) -> Result<PathBuf> {
    fs::create_dir_all(path).map_err(|e| {
        Error::config_with_hint(
            format!("output directory {} is not writable: {}", path.display(), e),
            "Pass --output-dir or set MAIL_AGENT_OUTPUT_DIR to a writable directory.",
        )
    })?;
    Ok(path.to_path_buf())
}

/// Write `bytes` into `dir` under `file_name`, or `stem_1.ext`, `stem_2.ext`
/// ... if taken. The file appears under its final name fully written or not
/// at all, and an existing file is never replaced.
pub fn write_atomically(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file_mut()
        .sync_all()?;

    let (stem, ext) = split_extension(file_name);
    for index in 0..MAX_COLLISIONS {
        let candidate = if index == 0 {
            dir.join(file_name)
        } else {
            dir.join(format!("{}_{}{}", stem, index, ext))
        };
        match tmp.persist_noclobber(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => tmp = e.file,
            Err(e) => {
                return Err(Error::Integrity(format!(
                    "couldn't move attachment into {}: {}",
                    candidate.display(),
                    e.error
                )))
            }
        }
    }
    Err(Error::Integrity(format!(
        "no free file name for '{}' in {}",
        file_name,
        dir.display()
    )))
}

#[derive(Debug, Clone, Serialize)]
pub struct WrittenFile {
    pub attachment_id: String,
    pub name: Option<String>,
    pub saved_path: PathBuf,
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub is_inline: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Inline,
    AlreadyDownloaded,
    NotDownloadable,
}

pub struct AttachmentFetcher<'a, S: MailStore + ?Sized> {
    store: &'a S,
    include_inline: bool,
}

impl<'a, S: MailStore + ?Sized> AttachmentFetcher<'a, S> {
    pub fn new(store: &'a S, include_inline: bool) -> Self {
        AttachmentFetcher {
            store,
            include_inline,
        }
    }

    /// Reasons to leave an attachment alone that don't depend on history.
    pub fn skip_reason(&self, record: &AttachmentRecord) -> Option<SkipReason> {
        if record.kind == AttachmentKind::Reference {
            Some(SkipReason::NotDownloadable)
        } else if record.is_inline && !self.include_inline {
            Some(SkipReason::Inline)
        } else {
            None
        }
    }

    /// Download one attachment into `target_dir`, creating it if needed.
    pub fn fetch(&self, record: &AttachmentRecord, target_dir: &Path) -> Result<WrittenFile> {
        let bytes = self
            .store
            .attachment_content(&record.message_id, &record.attachment_id)?;

        fs::create_dir_all(target_dir)?;
        let file_name = sanitize_filename(record.name.as_deref().unwrap_or_default());
        let saved_path = write_atomically(target_dir, &file_name, &bytes)?;
        debug!(
            message_id = %record.message_id,
            attachment_id = %record.attachment_id,
            path = %saved_path.display(),
            bytes = bytes.len(),
            "attachment written"
        );

        Ok(WrittenFile {
            attachment_id: record.attachment_id.clone(),
            name: record.name.clone(),
            saved_path,
            size_bytes: bytes.len() as u64,
            content_type: record.content_type.clone(),
            is_inline: record.is_inline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn reserved_and_control_characters_are_replaced() {
        assert_eq!(sanitize_filename("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_filename("line\nbreak.txt"), "line_break.txt");
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
    }

    #[test]
    fn empty_names_fall_back() {
        assert_eq!(sanitize_filename(""), FALLBACK_NAME);
        assert_eq!(sanitize_filename(" . . "), FALLBACK_NAME);
    }

    #[test]
    fn device_names_are_prefixed() {
        assert_eq!(sanitize_filename("con.txt"), "_con.txt");
        assert_eq!(sanitize_filename("LPT1"), "_LPT1");
        assert_eq!(sanitize_filename("console.txt"), "console.txt");
    }

    #[test]
    fn long_names_keep_extension() {
        let name = format!("{}.pdf", "x".repeat(300));
        let cleaned = sanitize_filename(&name);
        assert_eq!(cleaned.chars().count(), 180);
        assert!(cleaned.ends_with(".pdf"));
    }

    #[test]
    fn collisions_get_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_atomically(dir.path(), "report.pdf", b"one").unwrap();
        let second = write_atomically(dir.path(), "report.pdf", b"two").unwrap();
        let third = write_atomically(dir.path(), "report.pdf", b"three").unwrap();
        assert_eq!(first.file_name().unwrap(), "report.pdf");
        assert_eq!(second.file_name().unwrap(), "report_1.pdf");
        assert_eq!(third.file_name().unwrap(), "report_2.pdf");
        assert_eq!(fs::read(&first).unwrap(), b"one");
        assert_eq!(fs::read(&third).unwrap(), b"three");
    }

    #[test]
    fn message_dir_is_stable() {
        let message = MessageSummary {
            id: "AAMk-1".to_string(),
            subject: Some("Q1: numbers / draft".to_string()),
            from: None,
            received_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap(),
            is_read: false,
            has_attachments: true,
        };
        let name = message_dir_name(&message);
        assert!(name.starts_with("msg_20240301T101500Z_Q1_ numbers _ draft_"));
        assert_eq!(name, message_dir_name(&message));

        let untitled = MessageSummary {
            subject: None,
            ..message
        };
        assert!(message_dir_name(&untitled).contains("_no_subject_"));
    }
}

//! Durable per-stream sync state.
//!
//! A stream is one `(profile, folder_id)` pair. Each stream owns a directory
//! under the state base dir holding:
//!
//! * `state.json`, the current [`StreamState`], replaced atomically on every
//!   mutation;
//! * `ledger.jsonl`, an append-only event log. The set of downloaded
//!   attachment keys is rebuilt from its `downloaded` events on open.
//!
//! Every mutation is fsynced before the call returns, so a crash between two
//! attachments loses nothing that was reported as done.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const FIRST_RUN_BACKFILL_DAYS: i64 = 15;
pub const STATE_VERSION: u32 = 1;

const STATE_FILE: &str = "state.json";
const LEDGER_FILE: &str = "ledger.jsonl";
const WHOLE_MESSAGE: &str = "*";

/// Identity of one attachment within a mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentKey {
    pub message_id: String,
    pub attachment_id: String,
}

impl AttachmentKey {
    pub fn new<M: Into<String>, A: Into<String>>(message_id: M, attachment_id: A) -> Self {
        AttachmentKey {
            message_id: message_id.into(),
            attachment_id: attachment_id.into(),
        }
    }

    /// Stands for every attachment of a message whose attachment list could
    /// not be fetched.
    pub fn whole_message<M: Into<String>>(message_id: M) -> Self {
        AttachmentKey::new(message_id, WHOLE_MESSAGE)
    }

    pub fn is_whole_message(&self) -> bool {
        self.attachment_id == WHOLE_MESSAGE
    }
}

impl fmt::Display for AttachmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.message_id, self.attachment_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
    Integrity,
    Other,
}

impl FailureKind {
    pub fn classify(error: &Error) -> Self {
        if error.is_not_found() {
            FailureKind::Permanent
        } else if error.is_transient() {
            FailureKind::Transient
        } else {
            match error {
                Error::Integrity(_) | Error::Io(_) => FailureKind::Integrity,
                _ => FailureKind::Other,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFailure {
    pub message_id: String,
    pub attachment_id: String,
    pub attempts: u32,
    pub kind: FailureKind,
    pub last_error: String,
    pub last_attempt_at: String,
    pub first_failed_at: String,
}

impl PendingFailure {
    pub fn key(&self) -> AttachmentKey {
        AttachmentKey::new(self.message_id.clone(), self.attachment_id.clone())
    }
}

/// Contents of `state.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    pub version: u32,
    pub profile: String,
    pub folder_id: String,
    #[serde(default)]
    pub folder_path: Option<String>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub first_run_completed: bool,
    pub last_synced_at: String,
    #[serde(default)]
    pub last_run_started_at: Option<String>,
    #[serde(default)]
    pub last_run_completed_at: Option<String>,
    #[serde(default)]
    pub pending_failures: BTreeMap<String, PendingFailure>,
    #[serde(default)]
    pub downloaded_total: u64,
    #[serde(default)]
    pub skipped_total: u64,
    #[serde(default)]
    pub failed_total: u64,
}

impl StreamState {
    fn fresh(profile: &str, folder_id: &str, now: DateTime<Utc>) -> Self {
        StreamState {
            version: STATE_VERSION,
            profile: profile.to_string(),
            folder_id: folder_id.to_string(),
            folder_path: None,
            output_dir: None,
            first_run_completed: false,
            last_synced_at: iso_utc(now - Duration::days(FIRST_RUN_BACKFILL_DAYS)),
            last_run_started_at: None,
            last_run_completed_at: None,
            pending_failures: BTreeMap::new(),
            downloaded_total: 0,
            skipped_total: 0,
            failed_total: 0,
        }
    }

    pub fn last_synced(&self) -> Result<DateTime<Utc>> {
        crate::graph::parse_timestamp(&self.last_synced_at).ok_or_else(|| {
            Error::config_with_hint(
                format!("state has an unreadable last_synced_at '{}'", self.last_synced_at),
                "Run `state reset --confirm-reset` for this folder.",
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamPaths {
    pub stream_id: String,
    pub stream_dir: PathBuf,
    pub state_file: PathBuf,
    pub ledger_file: PathBuf,
}

impl StreamPaths {
    pub fn new(base_dir: &Path, profile: &str, folder_id: &str) -> Self {
        let stream_id = stream_id(profile, folder_id);
        let stream_dir = base_dir.join(&stream_id);
        StreamPaths {
            state_file: stream_dir.join(STATE_FILE),
            ledger_file: stream_dir.join(LEDGER_FILE),
            stream_dir,
            stream_id,
        }
    }

    fn exists(&self) -> bool {
        self.state_file.exists() || self.ledger_file.exists()
    }
}

pub fn stream_id(profile: &str, folder_id: &str) -> String {
    let mut hex = sha256_hex(&format!("{}|{}", profile, folder_id));
    hex.truncate(24);
    hex
}

pub(crate) fn sha256_hex(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// Read-only report for `state status`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub exists: bool,
    pub stream_id: String,
    pub stream_dir: PathBuf,
    pub state_file: PathBuf,
    pub ledger_file: PathBuf,
    pub state: Option<StreamState>,
    pub pending_failures_count: usize,
    pub completed_keys_count: usize,
    pub ledger_entries: usize,
}

/// One line of `ledger.jsonl`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent<'a> {
    RunStarted {
        run_id: &'a str,
        mode: &'a str,
        since: String,
    },
    Downloaded {
        run_id: &'a str,
        dedupe_key: String,
        message_id: &'a str,
        attachment_id: &'a str,
        name: &'a str,
        saved_path: String,
        bytes: u64,
    },
    SkippedAlreadyDownloaded {
        run_id: &'a str,
        dedupe_key: String,
        message_id: &'a str,
        attachment_id: &'a str,
    },
    Failed {
        run_id: &'a str,
        dedupe_key: String,
        message_id: &'a str,
        attachment_id: &'a str,
        kind: FailureKind,
        error: String,
    },
    RunCompleted {
        run_id: &'a str,
        status: &'a str,
        downloaded: usize,
        skipped: usize,
        failed: usize,
    },
}

#[derive(Serialize)]
struct LedgerLine<'a> {
    ts: String,
    #[serde(flatten)]
    event: &'a LedgerEvent<'a>,
}

/// Handle on an open stream. Owns the stream's state for the duration of a
/// run; nothing else writes to the stream directory.
pub struct Ledger {
    paths: StreamPaths,
    state: StreamState,
    completed: HashSet<String>,
}

impl Ledger {
    /// Open a stream, creating it on first use. A new stream starts with
    /// `last_synced_at` set to the backfill horizon before `now`.
    pub fn open(
        base_dir: &Path,
        profile: &str,
        folder_id: &str,
        folder_path: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let paths = StreamPaths::new(base_dir, profile, folder_id);
        fs::create_dir_all(&paths.stream_dir).map_err(|e| {
            Error::config_with_hint(
                format!("can't create state directory {}: {}", paths.stream_dir.display(), e),
                "Point --state-dir or MAIL_AGENT_STATE_DIR at a writable directory.",
            )
        })?;

        let mut state = match load_state(&paths.state_file)? {
            Some(state) => state,
            None => {
                info!(stream_id = %paths.stream_id, folder_id, "creating new sync stream");
                StreamState::fresh(profile, folder_id, now)
            }
        };
        state.version = STATE_VERSION;
        state.profile = profile.to_string();
        state.folder_id = folder_id.to_string();
        if let Some(path) = folder_path {
            state.folder_path = Some(path.to_string());
        }

        let completed = load_completed_keys(&paths.ledger_file)?;
        let ledger = Ledger {
            paths,
            state,
            completed,
        };
        ledger.save()?;
        Ok(ledger)
    }

    /// Inspect a stream without creating anything.
    pub fn status(base_dir: &Path, profile: &str, folder_id: &str) -> Result<StreamStatus> {
        let paths = StreamPaths::new(base_dir, profile, folder_id);
        let exists = paths.exists();
        let state = load_state(&paths.state_file)?;
        let completed = load_completed_keys(&paths.ledger_file)?;
        let ledger_entries = count_lines(&paths.ledger_file)?;
        Ok(StreamStatus {
            exists,
            pending_failures_count: state.as_ref().map_or(0, |s| s.pending_failures.len()),
            completed_keys_count: completed.len(),
            ledger_entries,
            state,
            stream_id: paths.stream_id,
            stream_dir: paths.stream_dir,
            state_file: paths.state_file,
            ledger_file: paths.ledger_file,
        })
    }

    /// Delete a stream's state and ledger. Irreversible; the next run of the
    /// stream starts over with the first-run horizon.
    pub fn reset(base_dir: &Path, profile: &str, folder_id: &str, confirm: bool) -> Result<StreamStatus> {
        if !confirm {
            return Err(Error::ConfirmationRequired {
                action: "state reset",
                flag: "--confirm-reset",
            });
        }
        let before = Ledger::status(base_dir, profile, folder_id)?;
        match fs::remove_dir_all(&before.stream_dir) {
            Ok(()) => info!(stream_id = %before.stream_id, "stream state removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(before)
    }

    pub fn paths(&self) -> &StreamPaths {
        &self.paths
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn is_downloaded(&self, key: &AttachmentKey) -> bool {
        self.completed.contains(&key.to_string())
    }

    pub fn pending_failures(&self) -> Vec<PendingFailure> {
        self.state
            .pending_failures
            .values()
            .cloned()
            .collect()
    }

    pub fn begin_run(
        &mut self,
        run_id: &str,
        mode: &str,
        since: DateTime<Utc>,
        output_dir: &Path,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.state.last_run_started_at = Some(iso_utc(now));
        self.state.output_dir = Some(output_dir.display().to_string());
        self.append(
            &LedgerEvent::RunStarted {
                run_id,
                mode,
                since: iso_utc(since),
            },
            now,
        )?;
        self.save()
    }

    /// Record a successful download. The ledger line is flushed before the
    /// state file, so a crash in between only leaves a stale pending entry.
    pub fn mark_downloaded(
        &mut self,
        run_id: &str,
        key: &AttachmentKey,
        name: &str,
        saved_path: &Path,
        bytes: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.append(
            &LedgerEvent::Downloaded {
                run_id,
                dedupe_key: key.to_string(),
                message_id: &key.message_id,
                attachment_id: &key.attachment_id,
                name,
                saved_path: saved_path.display().to_string(),
                bytes,
            },
            now,
        )?;
        self.completed.insert(key.to_string());
        self.state.pending_failures.remove(&key.to_string());
        self.state.downloaded_total += 1;
        self.save()
    }

    pub fn note_skipped(&mut self, run_id: &str, key: &AttachmentKey, now: DateTime<Utc>) -> Result<()> {
        self.append(
            &LedgerEvent::SkippedAlreadyDownloaded {
                run_id,
                dedupe_key: key.to_string(),
                message_id: &key.message_id,
                attachment_id: &key.attachment_id,
            },
            now,
        )?;
        self.state.pending_failures.remove(&key.to_string());
        self.state.skipped_total += 1;
        self.save()
    }

    /// Record a failed attempt. Attempts accumulate across runs; nothing is
    /// ever dropped except by success or reset.
    pub fn record_failure(
        &mut self,
        run_id: &str,
        key: &AttachmentKey,
        kind: FailureKind,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.append(
            &LedgerEvent::Failed {
                run_id,
                dedupe_key: key.to_string(),
                message_id: &key.message_id,
                attachment_id: &key.attachment_id,
                kind,
                error: reason.to_string(),
            },
            now,
        )?;

        let stamp = iso_utc(now);
        let entry = self
            .state
            .pending_failures
            .entry(key.to_string())
            .or_insert_with(|| PendingFailure {
                message_id: key.message_id.clone(),
                attachment_id: key.attachment_id.clone(),
                attempts: 0,
                kind,
                last_error: String::new(),
                last_attempt_at: stamp.clone(),
                first_failed_at: stamp.clone(),
            });
        entry.attempts += 1;
        entry.kind = kind;
        entry.last_error = reason.to_string();
        entry.last_attempt_at = stamp;
        self.state.failed_total += 1;
        self.save()
    }

    pub fn clear_failure(&mut self, key: &AttachmentKey) -> Result<()> {
        if self.state.pending_failures.remove(&key.to_string()).is_some() {
            self.save()?;
        }
        Ok(())
    }

    /// Close out a run. `advance_to` is `None` for aborted runs, which keep
    /// the previous `last_synced_at`.
    pub fn complete_run(
        &mut self,
        run_id: &str,
        status: &str,
        counts: (usize, usize, usize),
        advance_to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (downloaded, skipped, failed) = counts;
        self.append(
            &LedgerEvent::RunCompleted {
                run_id,
                status,
                downloaded,
                skipped,
                failed,
            },
            now,
        )?;

        if let Some(candidate) = advance_to {
            let previous = self.state.last_synced()?;
            if candidate > previous {
                self.state.last_synced_at = iso_utc(candidate);
            }
            self.state.first_run_completed = true;
        }
        self.state.last_run_completed_at = Some(iso_utc(now));
        self.save()
    }

    fn append(&self, event: &LedgerEvent<'_>, now: DateTime<Utc>) -> Result<()> {
        let line = LedgerLine {
            ts: iso_utc(now),
            event,
        };
        // Going through Value gives sorted keys.
        let value = serde_json::to_value(&line)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.ledger_file)?;
        writeln!(file, "{}", serde_json::to_string(&value)?)?;
        file.sync_all()?;
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let value = serde_json::to_value(&self.state)?;
        let mut tmp = NamedTempFile::new_in(&self.paths.stream_dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), &value)?;
        tmp.as_file_mut()
            .write_all(b"\n")?;
        tmp.as_file_mut()
            .sync_all()?;
        tmp.persist(&self.paths.state_file)
            .map_err(|e| e.error)?;
        debug!(stream_id = %self.paths.stream_id, "state saved");
        Ok(())
    }
}

fn load_state(path: &Path) -> Result<Option<StreamState>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let state = serde_json::from_str(&raw).map_err(|e| {
        Error::config_with_hint(
            format!("invalid state file {}: {}", path.display(), e),
            "Run `state reset --confirm-reset` for this folder to start over.",
        )
    })?;
    Ok(Some(state))
}

fn load_completed_keys(path: &Path) -> Result<HashSet<String>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e.into()),
    };

    let mut completed = HashSet::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }
        let event: Value = match serde_json::from_str(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(path = %path.display(), "skipping unreadable ledger line: {}", e);
                continue;
            }
        };
        if event.get("event").and_then(Value::as_str) != Some("downloaded") {
            continue;
        }
        if let Some(key) = event.get("dedupe_key").and_then(Value::as_str) {
            if !key.trim().is_empty() {
                completed.insert(key.trim().to_string());
            }
        }
    }
    Ok(completed)
}

fn count_lines(path: &Path) -> Result<usize> {
    match File::open(path) {
        Ok(file) => Ok(BufReader::new(file)
            .lines()
            .count()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// RFC 3339, second precision, `Z` suffix.
pub fn iso_utc(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

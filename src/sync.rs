//! The `download-new` and `download-recent` pipelines.
//!
//! `download-new` walks a folder from the stream's last sync point, fetches
//! every attachment the ledger hasn't seen, then retries whatever failed on
//! earlier runs. Each unit of work is recorded in the ledger as soon as it
//! finishes, so an interrupted run keeps everything it managed to do.
//!
//! `download-recent` grabs the attachments of the newest N messages and never
//! reads or writes the ledger.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::enumerate::{
    overlap_duration, CapReached, MessagePager, MessageWindow, PageCaps, MAX_PAGE_SIZE,
};
use crate::error::{Error, Result};
use crate::fetcher::{
    batch_dir, ensure_output_dir, message_dir_name, AttachmentFetcher, SkipReason, WrittenFile,
};
use crate::folders::{self, FolderSelector, ResolvedFolder};
use crate::graph::{AttachmentRecord, MailStore, MessageSummary};
use crate::ledger::{
    iso_utc, sha256_hex, AttachmentKey, FailureKind, Ledger, StreamStatus,
    FIRST_RUN_BACKFILL_DAYS,
};

pub const MODE_NEW: &str = "download_new";
pub const MODE_RECENT: &str = "download_recent";

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(0)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadNewOptions {
    pub selector: FolderSelector,
    pub include_hidden: bool,
    pub overlap_hours: i64,
    pub max_pages: usize,
    pub max_messages: usize,
    pub include_inline: bool,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DownloadRecentOptions {
    pub selector: FolderSelector,
    pub include_hidden: bool,
    pub top: usize,
    pub unread_only: bool,
    pub include_inline: bool,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithFailures,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithFailures => "completed_with_failures",
            RunStatus::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    CapReached,
    EnumerationFailed,
    Interrupted,
    ReauthRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Scan,
    Retry,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadedAttachment {
    pub dedupe_key: String,
    #[serde(flatten)]
    pub file: WrittenFile,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedAttachment {
    pub attachment_id: String,
    pub name: Option<String>,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedAttachment {
    pub attachment_id: String,
    pub name: Option<String>,
    pub kind: FailureKind,
    pub error: String,
}

/// What happened to each attachment of one message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageReport {
    pub message_id: String,
    pub subject: Option<String>,
    pub received_at: Option<String>,
    pub phase: Phase,
    pub downloaded: Vec<DownloadedAttachment>,
    pub skipped: Vec<SkippedAttachment>,
    pub failed: Vec<FailedAttachment>,
}

impl MessageReport {
    fn scanned(message: &MessageSummary) -> Self {
        MessageReport {
            message_id: message.id.clone(),
            subject: message.subject.clone(),
            received_at: Some(iso_utc(message.received_at)),
            phase: Phase::Scan,
            downloaded: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn retried(message_id: &str) -> Self {
        MessageReport {
            message_id: message_id.to_string(),
            subject: None,
            received_at: None,
            phase: Phase::Retry,
            downloaded: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn skip(&mut self, record: &AttachmentRecord, reason: SkipReason) {
        self.skipped.push(SkippedAttachment {
            attachment_id: record.attachment_id.clone(),
            name: record.name.clone(),
            reason,
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: &'static str,
    pub status: RunStatus,
    pub abort_reason: Option<AbortReason>,
    pub abort_detail: Option<String>,
    #[serde(flatten)]
    pub folder: ResolvedFolder,
    pub output_dir: PathBuf,
    pub since: String,
    pub since_source: String,
    pub first_run_backfill_days: i64,
    pub last_synced_before: String,
    pub last_synced_after: String,
    pub overlap_hours: i64,
    pub max_pages: usize,
    pub max_messages: usize,
    pub pages_fetched: usize,
    pub messages_scanned: usize,
    pub cap_reached: Option<CapReached>,
    pub retried_pending: usize,
    pub retried_success: usize,
    pub retried_failed: usize,
    pub downloaded_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub messages: Vec<MessageReport>,
    pub stream_id: String,
    pub state_file: PathBuf,
    pub ledger_file: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentSummary {
    pub run_id: String,
    pub mode: &'static str,
    pub status: RunStatus,
    #[serde(flatten)]
    pub folder: ResolvedFolder,
    pub top: usize,
    pub unread_only: bool,
    pub output_dir: PathBuf,
    pub messages_scanned: usize,
    pub downloaded_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub messages: Vec<MessageReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateReport {
    pub profile: String,
    #[serde(flatten)]
    pub folder: ResolvedFolder,
    #[serde(flatten)]
    pub status: StreamStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub profile: String,
    #[serde(flatten)]
    pub folder: ResolvedFolder,
    pub stream_id: String,
    pub removed: bool,
}

#[derive(Debug, Default)]
struct RetryCounters {
    pending: usize,
    success: usize,
    failed: usize,
}

/// Per-run bookkeeping shared by the scan and retry phases.
struct RunContext {
    ledger: Option<Ledger>,
    run_id: String,
    batch_dir: PathBuf,
    attempted: HashSet<AttachmentKey>,
    downloaded: usize,
    skipped: usize,
    failed: usize,
    abort: Option<(AbortReason, String)>,
}

impl RunContext {
    fn new(ledger: Option<Ledger>, run_id: String, batch_dir: PathBuf) -> Self {
        RunContext {
            ledger,
            run_id,
            batch_dir,
            attempted: HashSet::new(),
            downloaded: 0,
            skipped: 0,
            failed: 0,
            abort: None,
        }
    }

    fn set_abort(&mut self, reason: AbortReason, detail: String) {
        if self.abort.is_none() {
            warn!(run_id = %self.run_id, ?reason, "run aborted: {}", detail);
            self.abort = Some((reason, detail));
        }
    }

    fn is_downloaded(&self, key: &AttachmentKey) -> bool {
        self.ledger.as_ref().map_or(false, |l| l.is_downloaded(key))
    }
}

pub struct SyncEngine<'a, S: MailStore + ?Sized> {
    store: &'a S,
    state_dir: PathBuf,
    profile: String,
    clock: Box<dyn Clock + 'a>,
    interrupt: Arc<AtomicBool>,
}

impl<'a, S: MailStore + ?Sized> SyncEngine<'a, S> {
    pub fn new<P: Into<PathBuf>>(store: &'a S, state_dir: P, profile: &str) -> Self {
        SyncEngine {
            store,
            state_dir: state_dir.into(),
            profile: profile.to_string(),
            clock: Box::new(SystemClock),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock + 'a>) -> Self {
        self.clock = clock;
        self
    }

    /// The flag is polled between attachments; setting it aborts the run
    /// after the attachment in flight.
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    pub fn download_new(&self, options: &DownloadNewOptions) -> Result<RunSummary> {
        let caps = PageCaps::new(options.max_pages, options.max_messages)?;
        overlap_duration(options.overlap_hours)?;

        let folder = folders::resolve(self.store, &options.selector, options.include_hidden)?;
        let output_root = ensure_output_dir(&options.output_dir)?;

        let started = self.clock.now();
        let run_id = Uuid::new_v4()
            .simple()
            .to_string();
        let batch = batch_dir(&output_root, "new", started);

        let mut ledger = Ledger::open(
            &self.state_dir,
            &self.profile,
            &folder.resolved_folder_id,
            folder.resolved_folder_path.as_deref(),
            started,
        )?;
        let last_synced_before = ledger.state().last_synced_at.clone();
        let first_run = !ledger.state().first_run_completed;
        let (window, since_source) = if first_run {
            (
                MessageWindow::new(started - Duration::days(FIRST_RUN_BACKFILL_DAYS), 0)?,
                format!("first_run_backfill_{}d", FIRST_RUN_BACKFILL_DAYS),
            )
        } else {
            (
                MessageWindow::new(ledger.state().last_synced()?, options.overlap_hours)?,
                format!("last_synced_overlap_{}h", options.overlap_hours),
            )
        };
        let since = window.lower_bound();
        ledger.begin_run(&run_id, MODE_NEW, since, &batch, started)?;
        info!(
            run_id = %run_id,
            folder_id = %folder.resolved_folder_id,
            since = %iso_utc(since),
            first_run,
            "download-new started"
        );

        let stream = ledger
            .paths()
            .clone();
        let mut ctx = RunContext::new(Some(ledger), run_id, batch);
        let fetcher = AttachmentFetcher::new(self.store, options.include_inline);
        let mut messages = Vec::new();

        let mut pager = MessagePager::new(self.store, &folder.resolved_folder_id, Some(window), caps)
            .has_attachments_only(true);
        loop {
            if self.interrupted() {
                ctx.set_abort(AbortReason::Interrupted, "interrupted".to_string());
                break;
            }
            match pager.next() {
                None => break,
                Some(Ok(message)) => {
                    messages.push(self.scan_message(&mut ctx, &fetcher, &message)?);
                    if ctx.abort.is_some() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    let reason = match e {
                        Error::ReauthRequired(_) => AbortReason::ReauthRequired,
                        _ => AbortReason::EnumerationFailed,
                    };
                    ctx.set_abort(reason, e.to_string());
                    break;
                }
            }
        }

        let outcome = pager.outcome();
        if let Some(cap) = outcome.cap_reached {
            ctx.set_abort(
                AbortReason::CapReached,
                format!(
                    "stopped at {:?} after {} pages and {} messages with more messages remaining",
                    cap, outcome.pages_fetched, outcome.messages_yielded
                ),
            );
        }

        let mut retry = RetryCounters::default();
        if ctx.abort.is_none() {
            self.retry_pending(&mut ctx, &fetcher, &mut messages, &mut retry)?;
        }

        let status = match (&ctx.abort, ctx.failed) {
            (Some(_), _) => RunStatus::Aborted,
            (None, 0) => RunStatus::Completed,
            (None, _) => RunStatus::CompletedWithFailures,
        };
        let advance = if ctx.abort.is_none() { Some(started) } else { None };
        let counts = (ctx.downloaded, ctx.skipped, ctx.failed);
        let finished = self.clock.now();

        let last_synced_after = match ctx.ledger.as_mut() {
            Some(ledger) => {
                ledger.complete_run(&ctx.run_id, status.as_str(), counts, advance, finished)?;
                ledger.state().last_synced_at.clone()
            }
            None => last_synced_before.clone(),
        };
        info!(
            run_id = %ctx.run_id,
            status = status.as_str(),
            downloaded = ctx.downloaded,
            skipped = ctx.skipped,
            failed = ctx.failed,
            "download-new finished"
        );

        let (abort_reason, abort_detail) = match ctx.abort {
            Some((reason, detail)) => (Some(reason), Some(detail)),
            None => (None, None),
        };
        Ok(RunSummary {
            run_id: ctx.run_id,
            mode: MODE_NEW,
            status,
            abort_reason,
            abort_detail,
            folder,
            output_dir: ctx.batch_dir,
            since: iso_utc(since),
            since_source,
            first_run_backfill_days: if first_run { FIRST_RUN_BACKFILL_DAYS } else { 0 },
            last_synced_before,
            last_synced_after,
            overlap_hours: options.overlap_hours,
            max_pages: caps.max_pages,
            max_messages: caps.max_messages,
            pages_fetched: outcome.pages_fetched,
            messages_scanned: outcome.messages_yielded,
            cap_reached: outcome.cap_reached,
            retried_pending: retry.pending,
            retried_success: retry.success,
            retried_failed: retry.failed,
            downloaded_count: ctx.downloaded,
            skipped_count: ctx.skipped,
            failed_count: ctx.failed,
            messages,
            stream_id: stream.stream_id,
            state_file: stream.state_file,
            ledger_file: stream.ledger_file,
        })
    }

    pub fn download_recent(&self, options: &DownloadRecentOptions) -> Result<RecentSummary> {
        if options.top == 0 {
            return Err(Error::InvalidArgument("--top must be > 0".to_string()));
        }
        let pages = (options.top + MAX_PAGE_SIZE - 1) / MAX_PAGE_SIZE;
        let caps = PageCaps::new(pages, options.top)?;

        let folder = folders::resolve(self.store, &options.selector, options.include_hidden)?;
        let output_root = ensure_output_dir(&options.output_dir)?;
        let started = self.clock.now();
        let run_id = Uuid::new_v4()
            .simple()
            .to_string();
        let mut ctx = RunContext::new(None, run_id, batch_dir(&output_root, "recent", started));
        let fetcher = AttachmentFetcher::new(self.store, options.include_inline);

        let mut messages = Vec::new();
        let pager = MessagePager::new(self.store, &folder.resolved_folder_id, None, caps)
            .unread_only(options.unread_only)
            .has_attachments_only(true);
        for message in pager {
            if self.interrupted() {
                ctx.set_abort(AbortReason::Interrupted, "interrupted".to_string());
                break;
            }
            let message = message?;
            messages.push(self.scan_message(&mut ctx, &fetcher, &message)?);
            if let Some((AbortReason::ReauthRequired, detail)) = &ctx.abort {
                return Err(Error::ReauthRequired(detail.clone()));
            }
            if ctx.abort.is_some() {
                break;
            }
        }

        let status = match (&ctx.abort, ctx.failed) {
            (Some(_), _) => RunStatus::Aborted,
            (None, 0) => RunStatus::Completed,
            (None, _) => RunStatus::CompletedWithFailures,
        };
        info!(run_id = %ctx.run_id, status = status.as_str(), "download-recent finished");
        Ok(RecentSummary {
            run_id: ctx.run_id,
            mode: MODE_RECENT,
            status,
            folder,
            top: options.top,
            unread_only: options.unread_only,
            output_dir: ctx.batch_dir,
            messages_scanned: messages.len(),
            downloaded_count: ctx.downloaded,
            skipped_count: ctx.skipped,
            failed_count: ctx.failed,
            messages,
        })
    }

    pub fn state_status(&self, selector: &FolderSelector, include_hidden: bool) -> Result<StateReport> {
        let folder = folders::resolve(self.store, selector, include_hidden)?;
        let status = Ledger::status(&self.state_dir, &self.profile, &folder.resolved_folder_id)?;
        Ok(StateReport {
            profile: self.profile.clone(),
            folder,
            status,
        })
    }

    /// The confirmation gate is checked before anything touches the remote
    /// store or the disk.
    pub fn state_reset(
        &self,
        selector: &FolderSelector,
        include_hidden: bool,
        confirm: bool,
    ) -> Result<ResetReport> {
        if !confirm {
            return Err(Error::ConfirmationRequired {
                action: "state reset",
                flag: "--confirm-reset",
            });
        }
        let folder = folders::resolve(self.store, selector, include_hidden)?;
        let before = Ledger::reset(&self.state_dir, &self.profile, &folder.resolved_folder_id, true)?;
        Ok(ResetReport {
            profile: self.profile.clone(),
            folder,
            stream_id: before.stream_id,
            removed: before.exists,
        })
    }

    fn scan_message(
        &self,
        ctx: &mut RunContext,
        fetcher: &AttachmentFetcher<'a, S>,
        message: &MessageSummary,
    ) -> Result<MessageReport> {
        let mut report = MessageReport::scanned(message);
        let whole = AttachmentKey::whole_message(message.id.as_str());
        ctx.attempted.insert(whole.clone());

        let attachments = match self.store.list_attachments(&message.id) {
            Ok(attachments) => attachments,
            Err(e) => {
                self.fail(ctx, &mut report, &whole, None, e)?;
                return Ok(report);
            }
        };
        if let Some(ledger) = ctx.ledger.as_mut() {
            ledger.clear_failure(&whole)?;
        }

        let dir = ctx.batch_dir.join(message_dir_name(message));
        self.process_attachments(ctx, fetcher, &attachments, &dir, &mut report)?;
        Ok(report)
    }

    fn process_attachments(
        &self,
        ctx: &mut RunContext,
        fetcher: &AttachmentFetcher<'a, S>,
        attachments: &[AttachmentRecord],
        dir: &Path,
        report: &mut MessageReport,
    ) -> Result<()> {
        for record in attachments {
            if ctx.abort.is_some() {
                break;
            }
            if self.interrupted() {
                ctx.set_abort(AbortReason::Interrupted, "interrupted".to_string());
                break;
            }

            let key = AttachmentKey::new(record.message_id.as_str(), record.attachment_id.as_str());
            ctx.attempted.insert(key.clone());

            if ctx.is_downloaded(&key) {
                if let Some(ledger) = ctx.ledger.as_mut() {
                    ledger.note_skipped(&ctx.run_id, &key, self.clock.now())?;
                }
                ctx.skipped += 1;
                report.skip(record, SkipReason::AlreadyDownloaded);
                continue;
            }
            if let Some(reason) = fetcher.skip_reason(record) {
                ctx.skipped += 1;
                report.skip(record, reason);
                continue;
            }

            match fetcher.fetch(record, dir) {
                Ok(file) => {
                    if let Some(ledger) = ctx.ledger.as_mut() {
                        ledger.mark_downloaded(
                            &ctx.run_id,
                            &key,
                            record.name.as_deref().unwrap_or_default(),
                            &file.saved_path,
                            file.size_bytes,
                            self.clock.now(),
                        )?;
                    }
                    ctx.downloaded += 1;
                    report.downloaded.push(DownloadedAttachment {
                        dedupe_key: key.to_string(),
                        file,
                    });
                }
                Err(e) => self.fail(ctx, report, &key, record.name.clone(), e)?,
            }
        }
        Ok(())
    }

    /// Record a unit failure and carry on, unless the credentials are gone.
    fn fail(
        &self,
        ctx: &mut RunContext,
        report: &mut MessageReport,
        key: &AttachmentKey,
        name: Option<String>,
        error: Error,
    ) -> Result<()> {
        let kind = FailureKind::classify(&error);
        let reason = error.to_string();
        warn!(key = %key, ?kind, "download failed: {}", reason);

        if let Some(ledger) = ctx.ledger.as_mut() {
            ledger.record_failure(&ctx.run_id, key, kind, &reason, self.clock.now())?;
        }
        ctx.failed += 1;
        report.failed.push(FailedAttachment {
            attachment_id: key.attachment_id.clone(),
            name,
            kind,
            error: reason.clone(),
        });

        if let Error::ReauthRequired(_) = error {
            ctx.set_abort(AbortReason::ReauthRequired, reason);
        }
        Ok(())
    }

    fn retry_pending(
        &self,
        ctx: &mut RunContext,
        fetcher: &AttachmentFetcher<'a, S>,
        reports: &mut Vec<MessageReport>,
        retry: &mut RetryCounters,
    ) -> Result<()> {
        let pending = match ctx.ledger.as_ref() {
            Some(ledger) => ledger.pending_failures(),
            None => return Ok(()),
        };

        for failure in pending {
            let key = failure.key();
            if ctx.attempted.contains(&key) {
                continue;
            }
            if ctx.abort.is_some() {
                break;
            }
            if self.interrupted() {
                ctx.set_abort(AbortReason::Interrupted, "interrupted".to_string());
                break;
            }

            retry.pending += 1;
            ctx.attempted.insert(key.clone());
            let failed_before = ctx.failed;
            let mut report = MessageReport::retried(&key.message_id);
            let dir = ctx.batch_dir.join(retry_dir_name(&key.message_id));

            let listing = if key.is_whole_message() {
                self.store.list_attachments(&key.message_id)
            } else {
                self.store
                    .get_attachment(&key.message_id, &key.attachment_id)
                    .map(|record| vec![record])
            };
            match listing {
                Ok(records) => {
                    if key.is_whole_message() {
                        if let Some(ledger) = ctx.ledger.as_mut() {
                            ledger.clear_failure(&key)?;
                        }
                    }
                    self.process_attachments(ctx, fetcher, &records, &dir, &mut report)?;
                }
                Err(e) => self.fail(ctx, &mut report, &key, None, e)?,
            }

            if ctx.failed > failed_before {
                retry.failed += 1;
            } else {
                retry.success += 1;
            }
            reports.push(report);
        }
        Ok(())
    }
}

fn retry_dir_name(message_id: &str) -> String {
    let mut id = sha256_hex(message_id);
    id.truncate(12);
    format!("msg_retry_{}", id)
}

//! Lazy, newest-first message listing with page and message caps.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::{MailStore, MessageQuery, MessageSummary};

/// The remote store never returns more than this per page for our queries.
pub const MAX_PAGE_SIZE: usize = 50;

/// Lower bound of a listing: everything received at or after
/// `since - overlap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageWindow {
    pub since: DateTime<Utc>,
    pub overlap: Duration,
    lower_bound: DateTime<Utc>,
}

/// Validates an `--overlap-hours` value and turns it into a duration.
pub fn overlap_duration(overlap_hours: i64) -> Result<Duration> {
    if overlap_hours < 0 {
        return Err(Error::InvalidArgument(
            "--overlap-hours must be >= 0".to_string(),
        ));
    }
    Duration::try_hours(overlap_hours).ok_or_else(overlap_out_of_range)
}

fn overlap_out_of_range() -> Error {
    Error::InvalidArgument("--overlap-hours is out of range".to_string())
}

impl MessageWindow {
    pub fn new(since: DateTime<Utc>, overlap_hours: i64) -> Result<Self> {
        let overlap = overlap_duration(overlap_hours)?;
        let lower_bound = since
            .checked_sub_signed(overlap)
            .ok_or_else(overlap_out_of_range)?;
        Ok(MessageWindow {
            since,
            overlap,
            lower_bound,
        })
    }

    pub fn lower_bound(&self) -> DateTime<Utc> {
        self.lower_bound
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCaps {
    pub max_pages: usize,
    pub max_messages: usize,
}

impl PageCaps {
    pub fn new(max_pages: usize, max_messages: usize) -> Result<Self> {
        if max_pages == 0 {
            return Err(Error::InvalidArgument("--max-pages must be > 0".to_string()));
        }
        if max_messages == 0 {
            return Err(Error::InvalidArgument(
                "--max-messages must be > 0".to_string(),
            ));
        }
        Ok(PageCaps {
            max_pages,
            max_messages,
        })
    }

    pub fn page_size(&self) -> usize {
        self.max_messages.min(MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapReached {
    MaxPages,
    MaxMessages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EnumerationOutcome {
    pub pages_fetched: usize,
    pub messages_yielded: usize,
    pub cap_reached: Option<CapReached>,
}

/// Iterator over message summaries, fetching pages on demand.
///
/// Stops when the store runs out of pages or a cap is hit. A cap only counts
/// as reached when the store still had data to give; see [`outcome`].
///
/// [`outcome`]: MessagePager::outcome
pub struct MessagePager<'a, S: MailStore + ?Sized> {
    store: &'a S,
    query: MessageQuery,
    caps: PageCaps,
    buffer: VecDeque<MessageSummary>,
    cursor: Option<String>,
    started: bool,
    done: bool,
    outcome: EnumerationOutcome,
}

impl<'a, S: MailStore + ?Sized> MessagePager<'a, S> {
    pub fn new(store: &'a S, folder_id: &str, window: Option<MessageWindow>, caps: PageCaps) -> Self {
        let query = MessageQuery {
            folder_id: folder_id.to_string(),
            received_since: window.map(|w| w.lower_bound()),
            unread_only: false,
            has_attachments_only: false,
            page_size: caps.page_size(),
        };
        MessagePager {
            store,
            query,
            caps,
            buffer: VecDeque::new(),
            cursor: None,
            started: false,
            done: false,
            outcome: EnumerationOutcome::default(),
        }
    }

    pub fn unread_only(mut self, yes: bool) -> Self {
        self.query.unread_only = yes;
        self
    }

    pub fn has_attachments_only(mut self, yes: bool) -> Self {
        self.query.has_attachments_only = yes;
        self
    }

    pub fn query(&self) -> &MessageQuery {
        &self.query
    }

    pub fn outcome(&self) -> EnumerationOutcome {
        self.outcome
    }

    fn more_remote_pages(&self) -> bool {
        !self.started || self.cursor.is_some()
    }

    fn data_remains(&self) -> bool {
        !self.buffer.is_empty() || self.cursor.is_some()
    }

    fn fetch_page(&mut self) -> Result<()> {
        let page = self
            .store
            .list_messages(&self.query, self.cursor.as_deref())?;
        self.started = true;
        self.outcome.pages_fetched += 1;
        self.cursor = page.next_cursor;
        debug!(
            folder_id = %self.query.folder_id,
            page = self.outcome.pages_fetched,
            items = page.items.len(),
            more = self.cursor.is_some(),
            "fetched message page"
        );
        self.buffer.extend(page.items);
        Ok(())
    }
}

impl<'a, S: MailStore + ?Sized> Iterator for MessagePager<'a, S> {
    type Item = Result<MessageSummary>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            if self.outcome.messages_yielded >= self.caps.max_messages {
                if self.data_remains() {
                    self.outcome.cap_reached = Some(CapReached::MaxMessages);
                }
                self.done = true;
                return None;
            }

            if let Some(message) = self.buffer.pop_front() {
                self.outcome.messages_yielded += 1;
                return Some(Ok(message));
            }

            if !self.more_remote_pages() {
                self.done = true;
                return None;
            }

            if self.outcome.pages_fetched >= self.caps.max_pages {
                self.outcome.cap_reached = Some(CapReached::MaxPages);
                self.done = true;
                return None;
            }

            if let Err(e) = self.fetch_page() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

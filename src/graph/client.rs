use std::thread;
use std::time::Duration;

use chrono::SecondsFormat;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::types::*;
use super::MailStore;
use crate::auth::CredentialProvider;
use crate::error::{Error, RemoteErrorKind, Result};

pub const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

const MESSAGE_SELECT_FIELDS: &str = "id,subject,from,receivedDateTime,isRead,hasAttachments";
const FOLDER_SELECT_FIELDS: &str =
    "id,displayName,parentFolderId,childFolderCount,totalItemCount,unreadItemCount,isHidden";
const FOLDER_PAGE_SIZE: &str = "50";
const MAX_FOLDER_PAGES: usize = 200;
/// Upper bound on any single wait between retries.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Blocking client for a Microsoft Graph style mailbox API.
pub struct GraphClient {
    http: Client,
    base_url: Url,
    credentials: Box<dyn CredentialProvider>,
    max_retries: u32,
    backoff_floor: Duration,
    backoff_base: Duration,
}

impl GraphClient {
    pub fn new(
        base_url: &str,
        credentials: Box<dyn CredentialProvider>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/')).map_err(|e| {
            Error::config_with_hint(
                format!("invalid base_url '{}': {}", base_url, e),
                "Set connection.base_url to an absolute http(s) URL.",
            )
        })?;
        if base_url.cannot_be_a_base() {
            return Err(Error::config(format!(
                "base_url '{}' cannot carry a path",
                base_url
            )));
        }
        let http = Client::builder().timeout(timeout).build()?;
        Ok(GraphClient {
            http,
            base_url,
            credentials,
            max_retries,
            backoff_floor: Duration::from_millis(500),
            backoff_base: Duration::from_secs(1),
        })
    }

    /// Override the throttling delays. The floor applies to server supplied
    /// `Retry-After` values, the base to the exponential fallback.
    pub fn with_backoff(mut self, floor: Duration, base: Duration) -> Self {
        self.backoff_floor = floor;
        self.backoff_base = base;
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::config(format!("base_url '{}' cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_base
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY)
    }

    fn retry_delay(&self, headers: &HeaderMap, attempt: u32) -> Duration {
        let server_hint = headers
            .get(RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(MAX_RETRY_DELAY));

        match server_hint {
            Some(delay) => delay
                .max(self.backoff_floor)
                .min(MAX_RETRY_DELAY),
            None => self.backoff_delay(attempt),
        }
    }

    fn send(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Response> {
        let mut attempt = 0;
        let mut refreshed = false;

        loop {
            let token = self.credentials.bearer_token()?;
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(token)
                .header(ACCEPT, "application/json")
                .header("Prefer", "IdType=\"ImmutableId\"");
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send() {
                Ok(response) => response,
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt < self.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    warn!(%url, attempt, ?delay, "request failed ({}), retrying", e);
                    thread::sleep(delay);
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                if !refreshed {
                    debug!(%url, "token rejected, refreshing credentials once");
                    self.credentials.invalidate();
                    refreshed = true;
                    continue;
                }
                return Err(Error::ReauthRequired(remote_message(response)));
            }

            if is_throttled(status) && attempt < self.max_retries {
                let delay = self.retry_delay(response.headers(), attempt);
                warn!(%url, status = status.as_u16(), attempt, ?delay, "remote store throttled, backing off");
                thread::sleep(delay);
                attempt += 1;
                continue;
            }

            if status.is_client_error() || status.is_server_error() {
                return Err(remote_error(response));
            }

            return Ok(response);
        }
    }

    fn get_json<T: DeserializeOwned>(&self, url: Url, query: &[(&str, String)]) -> Result<T> {
        let response = self.send(Method::GET, url, query, None)?;
        Ok(response.json()?)
    }

    fn send_json(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value> {
        let response = self.send(method, url, &[], body)?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(json!({}));
        }
        let bytes = response.bytes()?;
        if bytes.is_empty() {
            return Ok(json!({}));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn is_throttled(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

fn remote_message(response: Response) -> String {
    let status = response.status();
    let text = response.text().unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|b| b.error)
        .map(|e| match (e.code, e.message) {
            (Some(code), Some(message)) => format!("{} - {}", code, message),
            (None, Some(message)) => message,
            (Some(code), None) => code,
            (None, None) => String::new(),
        })
        .unwrap_or_else(|| text.trim().chars().take(500).collect());

    if detail.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        detail
    }
}

fn remote_error(response: Response) -> Error {
    let status = response.status();
    let kind = match status.as_u16() {
        404 | 410 => RemoteErrorKind::Permanent,
        408 | 429 | 500 | 502 | 503 | 504 => RemoteErrorKind::Transient,
        _ => RemoteErrorKind::Rejected,
    };
    Error::Remote {
        status: status.as_u16(),
        kind,
        message: remote_message(response),
    }
}

impl MailStore for GraphClient {
    fn get_folder(&self, folder: &str) -> Result<FolderRecord> {
        let url = self.endpoint(&["me", "mailFolders", folder])?;
        let wire: WireFolder = self.get_json(url, &[("$select", FOLDER_SELECT_FIELDS.to_string())])?;
        FolderRecord::try_from(wire)
    }

    fn list_child_folders(
        &self,
        folder_id: &str,
        include_hidden: bool,
    ) -> Result<Vec<FolderRecord>> {
        let mut query = vec![
            ("$select", FOLDER_SELECT_FIELDS.to_string()),
            ("$top", FOLDER_PAGE_SIZE.to_string()),
        ];
        if include_hidden {
            query.push(("includeHiddenFolders", "true".to_string()));
        }

        let mut url = self.endpoint(&["me", "mailFolders", folder_id, "childFolders"])?;
        let mut folders = Vec::new();
        for _ in 0..MAX_FOLDER_PAGES {
            let page: WirePage<WireFolder> = self.get_json(url, &query)?;
            for wire in page.value {
                folders.push(FolderRecord::try_from(wire)?);
            }
            match page.next_link {
                Some(next) => {
                    url = parse_next_link(&next)?;
                    query.clear();
                }
                None => return Ok(folders),
            }
        }
        warn!(folder_id, "child folder listing stopped after {} pages", MAX_FOLDER_PAGES);
        Ok(folders)
    }

    fn list_messages(
        &self,
        query: &MessageQuery,
        cursor: Option<&str>,
    ) -> Result<Page<MessageSummary>> {
        let page: WirePage<WireMessage> = match cursor {
            Some(next) => self.get_json(parse_next_link(next)?, &[])?,
            None => {
                let url = self.endpoint(&["me", "mailFolders", &query.folder_id, "messages"])?;
                let mut params = vec![
                    ("$top", query.page_size.max(1).to_string()),
                    ("$orderby", "receivedDateTime DESC".to_string()),
                    ("$select", MESSAGE_SELECT_FIELDS.to_string()),
                ];
                let filter = message_filter(query);
                if !filter.is_empty() {
                    params.push(("$filter", filter));
                }
                self.get_json(url, &params)?
            }
        };

        let items = page
            .value
            .into_iter()
            .map(MessageSummary::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page {
            items,
            next_cursor: page.next_link,
        })
    }

    fn list_attachments(&self, message_id: &str) -> Result<Vec<AttachmentRecord>> {
        let url = self.endpoint(&["me", "messages", message_id, "attachments"])?;
        let page: WirePage<WireAttachment> = self.get_json(url, &[])?;
        page.value
            .into_iter()
            .map(|wire| AttachmentRecord::from_wire(message_id, wire))
            .collect()
    }

    fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<AttachmentRecord> {
        let url = self.endpoint(&["me", "messages", message_id, "attachments", attachment_id])?;
        let wire: WireAttachment = self.get_json(url, &[])?;
        AttachmentRecord::from_wire(message_id, wire)
    }

    fn attachment_content(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>> {
        let url = self.endpoint(&[
            "me",
            "messages",
            message_id,
            "attachments",
            attachment_id,
            "$value",
        ])?;
        let response = self.send(Method::GET, url, &[], None)?;
        Ok(response.bytes()?.to_vec())
    }

    fn get_message(&self, message_id: &str) -> Result<Value> {
        let url = self.endpoint(&["me", "messages", message_id])?;
        self.get_json(url, &[])
    }

    fn mark_message(&self, message_id: &str, read: bool) -> Result<Value> {
        let url = self.endpoint(&["me", "messages", message_id])?;
        self.send_json(Method::PATCH, url, Some(&json!({ "isRead": read })))
    }

    fn create_draft(&self, draft: &Draft) -> Result<Value> {
        let url = self.endpoint(&["me", "messages"])?;
        let recipients: Vec<Value> = draft
            .to
            .iter()
            .map(|address| json!({ "emailAddress": { "address": address } }))
            .collect();
        let body = json!({
            "subject": draft.subject,
            "body": { "contentType": draft.body_content_type, "content": draft.body },
            "toRecipients": recipients,
        });
        self.send_json(Method::POST, url, Some(&body))
    }

    fn send_draft(&self, message_id: &str) -> Result<()> {
        let url = self.endpoint(&["me", "messages", message_id, "send"])?;
        self.send(Method::POST, url, &[], None)?;
        Ok(())
    }
}

fn parse_next_link(next: &str) -> Result<Url> {
    Url::parse(next).map_err(|e| Error::malformed("page", format!("bad @odata.nextLink: {}", e)))
}

fn message_filter(query: &MessageQuery) -> String {
    let mut filters = Vec::new();
    if query.unread_only {
        filters.push("isRead eq false".to_string());
    }
    if query.has_attachments_only {
        filters.push("hasAttachments eq true".to_string());
    }
    if let Some(since) = query.received_since {
        filters.push(format!(
            "receivedDateTime ge {}",
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
    }
    filters.join(" and ")
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// How a remote failure should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Throttling, timeouts and 5xx responses that survived the retry loop.
    Transient,
    /// The message or attachment no longer exists.
    Permanent,
    /// Any other 4xx response.
    Rejected,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        remediation: Option<String>,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{action} requires {flag}")]
    ConfirmationRequired {
        action: &'static str,
        flag: &'static str,
    },

    #[error(
        "Folder path segment '{segment}' not found under '{consumed}'. Available children: {}",
        preview(.available)
    )]
    FolderNotFound {
        segment: String,
        consumed: String,
        available: Vec<String>,
    },

    #[error(
        "Folder path segment '{segment}' is ambiguous under '{consumed}'. Matching folder ids: {}",
        .candidates.join(", ")
    )]
    AmbiguousFolderPath {
        segment: String,
        consumed: String,
        candidates: Vec<String>,
    },

    #[error("Folder traversal exceeded max nodes ({limit})")]
    TraversalLimitExceeded { limit: usize },

    #[error("Re-authentication required: {0}")]
    ReauthRequired(String),

    #[error("Remote request failed with status {status}: {message}")]
    Remote {
        status: u16,
        kind: RemoteErrorKind,
        message: String,
    },

    #[error("Malformed {what} record: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn preview(available: &[String]) -> String {
    if available.is_empty() {
        return "<none>".to_string();
    }
    available
        .iter()
        .take(20)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Error::Config {
            message: message.into(),
            remediation: None,
        }
    }

    pub fn config_with_hint<S: Into<String>, H: Into<String>>(message: S, hint: H) -> Self {
        Error::Config {
            message: message.into(),
            remediation: Some(hint.into()),
        }
    }

    pub fn malformed<S: Into<String>>(what: &'static str, detail: S) -> Self {
        Error::Malformed {
            what,
            detail: detail.into(),
        }
    }

    /// Stable name used as `error.type` in the output envelope.
    pub fn type_name(&self) -> &'static str {
        match self {
            Error::Config { .. } => "ConfigError",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::ConfirmationRequired { .. } => "ConfirmationRequired",
            Error::FolderNotFound { .. } => "FolderNotFound",
            Error::AmbiguousFolderPath { .. } => "AmbiguousFolderPath",
            Error::TraversalLimitExceeded { .. } => "TraversalLimitExceeded",
            Error::ReauthRequired(_) => "ReauthRequired",
            Error::Remote { .. } => "RemoteError",
            Error::Malformed { .. } => "MalformedRecord",
            Error::Integrity(_) => "IntegrityError",
            Error::Network(_) => "NetworkError",
            Error::Io(_) => "IoError",
            Error::Json(_) => "JsonError",
        }
    }

    pub fn remediation(&self) -> Option<String> {
        match self {
            Error::Config { remediation, .. } => remediation.clone(),
            Error::ConfirmationRequired { flag, .. } => {
                Some(format!("Rerun with {} once the action is intended.", flag))
            }
            Error::TraversalLimitExceeded { .. } => {
                Some("Rerun with a higher --max-nodes value.".to_string())
            }
            Error::FolderNotFound { .. } | Error::AmbiguousFolderPath { .. } => Some(
                "Run `folders tree` to inspect the hierarchy, or select the folder with --folder-id."
                    .to_string(),
            ),
            Error::ReauthRequired(_) => {
                Some("Refresh the access token supplied by the credential provider.".to_string())
            }
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config { .. } | Error::InvalidArgument(_) => 2,
            Error::FolderNotFound { .. }
            | Error::AmbiguousFolderPath { .. }
            | Error::TraversalLimitExceeded { .. } => 3,
            Error::ReauthRequired(_)
            | Error::Remote { .. }
            | Error::Malformed { .. }
            | Error::Network(_) => 4,
            Error::ConfirmationRequired { .. } => 5,
            _ => 1,
        }
    }

    /// Transient failures are worth another attempt on a later run.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Remote { kind, .. } => *kind == RemoteErrorKind::Transient,
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Remote {
                kind: RemoteErrorKind::Permanent,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_not_found_names_segment_and_prefix() {
        let err = Error::FolderNotFound {
            segment: "Reports".to_string(),
            consumed: "/Inbox/Finance".to_string(),
            available: vec!["Invoices".to_string(), "Receipts".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("'Reports'"));
        assert!(text.contains("'/Inbox/Finance'"));
        assert!(text.contains("Invoices, Receipts"));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn empty_children_preview() {
        let err = Error::FolderNotFound {
            segment: "x".to_string(),
            consumed: "/Inbox".to_string(),
            available: vec![],
        };
        assert!(err.to_string().ends_with("<none>"));
    }

    #[test]
    fn traversal_limit_names_limit() {
        let err = Error::TraversalLimitExceeded { limit: 7 };
        assert!(err.to_string().contains("(7)"));
        assert!(err.remediation().unwrap().contains("--max-nodes"));
    }
}

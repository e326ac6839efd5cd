use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::config;
use crate::folders::{FolderSelector, DEFAULT_FOLDER_ROOT};
use crate::output::Format;

/// Mailbox automation for agents: folders, messages and incremental
/// attachment downloads, with machine readable output.
#[derive(Parser, Debug)]
#[clap(author, version)]
pub struct Args {
    /// Specify location of config file.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Profile name; one sync state per profile and folder.
    #[clap(long, global = true)]
    pub profile: Option<String>,

    /// Output format: json or text.
    #[clap(long, global = true, default_value = "json")]
    pub format: Format,

    /// Directory holding sync state.
    #[clap(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Base URL of the mailbox API.
    #[clap(long, global = true)]
    pub base_url: Option<String>,

    /// Retries for throttled requests.
    #[clap(long, global = true)]
    pub max_retries: Option<u32>,

    /// Log debug output to stderr.
    #[clap(long, short, global = true)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Command,
}

// Command line beats environment, which beats the config file.
impl Args {
    #[rustfmt::skip]
    pub fn overwrite_config(&self, config: config::Config) -> config::Config {
        config::Config {
            profile: self.profile.clone().or(config.profile),
            connection: config::Connection {
                base_url : self.base_url.as_ref().unwrap_or(&config.connection.base_url).clone(),
                max_retries : self.max_retries.unwrap_or(config.connection.max_retries),
                ..config.connection
            },
            sync: config::SyncSettings {
                state_dir : self.state_dir.clone().or(config.sync.state_dir),
                ..config.sync
            },
            ..config
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Message operations.
    #[clap(subcommand)]
    Mail(MailCommand),

    /// Folder discovery.
    #[clap(subcommand)]
    Folders(FoldersCommand),

    /// Attachment operations, including incremental sync.
    #[clap(subcommand)]
    Attachments(AttachmentsCommand),

    /// Inspect or reset the sync state of one folder.
    #[clap(subcommand)]
    State(StateCommand),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct FolderArgs {
    /// Well-known folder name or id.
    #[clap(long, default_value = DEFAULT_FOLDER_ROOT)]
    pub folder: String,

    /// Folder id, used as is.
    #[clap(long)]
    pub folder_id: Option<String>,

    /// Slash separated path below the inbox, e.g. "Clients/ACME".
    #[clap(long)]
    pub folder_path: Option<String>,

    /// Consider hidden folders when resolving a path.
    #[clap(long, alias = "include-hidden-folders")]
    pub include_hidden: bool,
}

impl FolderArgs {
    pub fn selector(&self) -> crate::Result<FolderSelector> {
        FolderSelector::from_args(
            Some(self.folder.as_str()),
            self.folder_id.as_deref(),
            self.folder_path.as_deref(),
        )
    }
}

#[derive(Subcommand, Debug)]
pub enum MailCommand {
    /// List messages, newest first.
    List {
        #[clap(flatten)]
        folder: FolderArgs,

        #[clap(long)]
        unread_only: bool,

        #[clap(long, default_value = "10")]
        top: usize,
    },

    /// Fetch one message.
    Get {
        #[clap(long)]
        message_id: String,
    },

    /// Mark a message read or unread.
    Mark {
        #[clap(long)]
        message_id: String,

        /// true or false.
        #[clap(long)]
        read: String,
    },

    /// Create a draft.
    Draft {
        /// Recipient(s); also accepts ; or , separated lists.
        #[clap(long, required = true, multiple_values = true)]
        to: Vec<String>,

        #[clap(long)]
        subject: String,

        #[clap(long)]
        body: Option<String>,

        /// Read the body from a file instead.
        #[clap(long)]
        body_file: Option<PathBuf>,

        /// Text or HTML.
        #[clap(long, default_value = "Text")]
        body_content_type: String,
    },

    /// Send an existing draft.
    SendDraft {
        #[clap(long)]
        message_id: String,

        /// Required; nothing is sent without it.
        #[clap(long)]
        confirm_send: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum FoldersCommand {
    /// Folder tree and flat index below a root folder.
    Tree {
        #[clap(long, default_value = DEFAULT_FOLDER_ROOT)]
        root: String,

        #[clap(long)]
        include_hidden: bool,

        /// Fail instead of walking more than this many folders.
        #[clap(long)]
        max_nodes: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
pub enum AttachmentsCommand {
    /// List the attachments of a message.
    List {
        #[clap(long)]
        message_id: String,
    },

    /// Download one attachment.
    Download {
        #[clap(long)]
        message_id: String,

        #[clap(long)]
        attachment_id: String,

        #[clap(long)]
        output_dir: Option<PathBuf>,
    },

    /// Download every attachment of a message.
    DownloadAll {
        #[clap(long)]
        message_id: String,

        #[clap(long)]
        output_dir: Option<PathBuf>,

        #[clap(long)]
        include_inline: bool,
    },

    /// Attachments of the newest messages. Does not use sync state.
    DownloadRecent {
        #[clap(flatten)]
        folder: FolderArgs,

        #[clap(long)]
        top: Option<usize>,

        #[clap(long)]
        unread_only: bool,

        #[clap(long)]
        include_inline: bool,

        #[clap(long)]
        output_dir: Option<PathBuf>,
    },

    /// Only attachments not downloaded by an earlier run.
    DownloadNew {
        #[clap(flatten)]
        folder: FolderArgs,

        #[clap(long)]
        overlap_hours: Option<i64>,

        #[clap(long)]
        max_pages: Option<usize>,

        #[clap(long)]
        max_messages: Option<usize>,

        #[clap(long)]
        include_inline: bool,

        #[clap(long)]
        output_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum StateCommand {
    /// Show the sync state of a folder.
    Status {
        #[clap(flatten)]
        folder: FolderArgs,
    },

    /// Delete the sync state of a folder. Irreversible.
    Reset {
        #[clap(flatten)]
        folder: FolderArgs,

        #[clap(long)]
        confirm_reset: bool,
    },
}

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use tracing::debug;

use mail_agent::args::{
    Args, AttachmentsCommand, Command, FoldersCommand, MailCommand, StateCommand,
};
use mail_agent::sync::{DownloadNewOptions, DownloadRecentOptions, SyncEngine};
use mail_agent::{config, logging, mail, output, Error};

fn main() {
    let args = Args::parse();

    if let Err(e) = logging::init_logging(args.verbose) {
        eprintln!("{:#}", e);
    }

    let (envelope, code) = match run(&args) {
        Ok(result) => (output::success(result), 0),
        Err(e) => match e.downcast_ref::<Error>() {
            Some(err) => (output::failure(err), err.exit_code()),
            None => (output::failure_parts("Error", &format!("{:#}", e), None), 1),
        },
    };

    println!("{}", output::render(&envelope, args.format));
    std::process::exit(code);
}

fn load_config(args: &Args) -> Result<config::Config> {
    let config = config::get_config(&args.config).map_err(|e| {
        Error::config_with_hint(
            format!("{:#}", e),
            "Fix the file passed with --config, or mail_agent.toml in the working directory.",
        )
    })?;
    Ok(args.overwrite_config(config))
}

fn state_dir(config: &config::Config) -> Result<PathBuf> {
    config.state_dir().map_err(|e| {
        Error::config_with_hint(
            format!("{:#}", e),
            "Pass --state-dir or set MAIL_AGENT_STATE_DIR.",
        )
        .into()
    })
}

/// Ctrl-C sets the flag; sync runs stop between attachments.
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
        eprintln!("Got SIGINT, stopping after the current attachment...");
    })?;
    Ok(flag)
}

fn run(args: &Args) -> Result<Value> {
    let config = load_config(args)?;
    let profile = config.profile();
    debug!(profile = %profile, "configuration loaded");

    let value = match &args.command {
        Command::Mail(command) => match command {
            MailCommand::SendDraft {
                confirm_send: false,
                ..
            } => {
                return Err(Error::ConfirmationRequired {
                    action: "send-draft",
                    flag: "--confirm-send",
                }
                .into())
            }
            MailCommand::SendDraft { message_id, .. } => {
                mail::send_draft(&mail_agent::connect(&config)?, message_id, true)?
            }
            MailCommand::List {
                folder,
                unread_only,
                top,
            } => mail::list_messages(
                &mail_agent::connect(&config)?,
                &folder.selector()?,
                folder.include_hidden,
                *unread_only,
                *top,
            )?,
            MailCommand::Get { message_id } => {
                mail::get_message(&mail_agent::connect(&config)?, message_id)?
            }
            MailCommand::Mark { message_id, read } => {
                mail::mark_message(&mail_agent::connect(&config)?, message_id, read)?
            }
            MailCommand::Draft {
                to,
                subject,
                body,
                body_file,
                body_content_type,
            } => {
                let body = mail::read_body(body_file.as_ref(), body.as_deref())?;
                mail::create_draft(
                    &mail_agent::connect(&config)?,
                    to,
                    subject,
                    &body,
                    body_content_type,
                )?
            }
        },

        Command::Folders(FoldersCommand::Tree {
            root,
            include_hidden,
            max_nodes,
        }) => mail::folder_tree(
            &mail_agent::connect(&config)?,
            root,
            *include_hidden,
            max_nodes.unwrap_or(config.sync.max_folder_nodes),
        )?,

        Command::Attachments(command) => {
            let output_dir = |dir: &Option<PathBuf>| {
                dir.clone()
                    .unwrap_or_else(|| config.output_dir())
            };
            match command {
                AttachmentsCommand::List { message_id } => {
                    mail::list_attachments(&mail_agent::connect(&config)?, message_id)?
                }
                AttachmentsCommand::Download {
                    message_id,
                    attachment_id,
                    output_dir: dir,
                } => mail::download_attachment(
                    &mail_agent::connect(&config)?,
                    message_id,
                    attachment_id,
                    &output_dir(dir),
                )?,
                AttachmentsCommand::DownloadAll {
                    message_id,
                    output_dir: dir,
                    include_inline,
                } => mail::download_all(
                    &mail_agent::connect(&config)?,
                    message_id,
                    &output_dir(dir),
                    *include_inline,
                )?,
                AttachmentsCommand::DownloadRecent {
                    folder,
                    top,
                    unread_only,
                    include_inline,
                    output_dir: dir,
                } => {
                    let options = DownloadRecentOptions {
                        selector: folder.selector()?,
                        include_hidden: folder.include_hidden,
                        top: top.unwrap_or(config.sync.recent_top),
                        unread_only: *unread_only,
                        include_inline: *include_inline,
                        output_dir: output_dir(dir),
                    };
                    let client = mail_agent::connect(&config)?;
                    let engine = SyncEngine::new(&client, state_dir(&config)?, &profile)
                        .with_interrupt(interrupt_flag()?);
                    serde_json::to_value(engine.download_recent(&options)?)?
                }
                AttachmentsCommand::DownloadNew {
                    folder,
                    overlap_hours,
                    max_pages,
                    max_messages,
                    include_inline,
                    output_dir: dir,
                } => {
                    let options = DownloadNewOptions {
                        selector: folder.selector()?,
                        include_hidden: folder.include_hidden,
                        overlap_hours: overlap_hours.unwrap_or(config.sync.overlap_hours),
                        max_pages: max_pages.unwrap_or(config.sync.max_pages),
                        max_messages: max_messages.unwrap_or(config.sync.max_messages),
                        include_inline: *include_inline,
                        output_dir: output_dir(dir),
                    };
                    let client = mail_agent::connect(&config)?;
                    let engine = SyncEngine::new(&client, state_dir(&config)?, &profile)
                        .with_interrupt(interrupt_flag()?);
                    serde_json::to_value(engine.download_new(&options)?)?
                }
            }
        }

        Command::State(StateCommand::Reset {
            confirm_reset: false,
            ..
        }) => {
            return Err(Error::ConfirmationRequired {
                action: "state reset",
                flag: "--confirm-reset",
            }
            .into())
        }
        Command::State(StateCommand::Reset { folder, .. }) => {
            let client = mail_agent::connect(&config)?;
            let engine = SyncEngine::new(&client, state_dir(&config)?, &profile);
            serde_json::to_value(engine.state_reset(&folder.selector()?, folder.include_hidden, true)?)?
        }
        Command::State(StateCommand::Status { folder }) => {
            let client = mail_agent::connect(&config)?;
            let engine = SyncEngine::new(&client, state_dir(&config)?, &profile);
            serde_json::to_value(engine.state_status(&folder.selector()?, folder.include_hidden)?)?
        }
    };

    Ok(value)
}

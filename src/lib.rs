pub mod args;
pub mod auth;
pub mod config;
pub mod enumerate;
pub mod error;
pub mod fetcher;
pub mod folders;
pub mod graph;
pub mod ledger;
pub mod logging;
pub mod mail;
pub mod output;
pub mod sync;

use std::time::Duration;

pub use error::{Error, Result};

use graph::GraphClient;

/// Build a client for the configured mailbox.
pub fn connect(config: &config::Config) -> Result<GraphClient> {
    let credentials = auth::from_config(&config.auth)?;
    GraphClient::new(
        &config.connection.base_url,
        credentials,
        Duration::from_secs(config.connection.timeout_secs),
        config.connection.max_retries,
    )
}

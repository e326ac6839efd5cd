use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::{self};
use std::path::{Path, PathBuf};

use crate::graph::client::DEFAULT_BASE_URL;

const DEFAULT_CONFIG_FILE: &str = "mail_agent.toml";
const DEFAULT_OUTPUT_DIR: &str = "./mail_downloads";
const DEFAULT_PROFILE: &str = "default";

pub const PROFILE_ENV: &str = "MAIL_AGENT_PROFILE";
pub const STATE_DIR_ENV: &str = "MAIL_AGENT_STATE_DIR";
pub const OUTPUT_DIR_ENV: &str = "MAIL_AGENT_OUTPUT_DIR";
pub const TOKEN_ENV: &str = "MAIL_AGENT_ACCESS_TOKEN";

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub profile: Option<String>,
    pub connection: Connection,
    pub auth: Auth,
    pub sync: SyncSettings,
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct Connection {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for Connection {
    fn default() -> Self {
        Connection {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct Auth {
    /// Program and arguments printing a bearer token on stdout.
    pub token_command: Option<Vec<String>>,
    /// Environment variable holding a bearer token.
    pub token_env: String,
}

impl Default for Auth {
    fn default() -> Self {
        Auth {
            token_command: None,
            token_env: TOKEN_ENV.to_string(),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct SyncSettings {
    pub output_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub overlap_hours: i64,
    pub max_pages: usize,
    pub max_messages: usize,
    pub max_folder_nodes: usize,
    pub recent_top: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            output_dir: None,
            state_dir: None,
            overlap_hours: 48,
            max_pages: 20,
            max_messages: 1000,
            max_folder_nodes: 5000,
            recent_top: 10,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Config> {
        let mut config: Config = toml::from_str(s).context("Couldn't parse the config file")?;
        config.apply_env();
        Ok(config)
    }

    /// Environment variables sit between the config file and the command line.
    fn apply_env(&mut self) {
        if let Some(profile) = env_value(PROFILE_ENV) {
            self.profile = Some(profile);
        }
        if let Some(dir) = env_value(STATE_DIR_ENV) {
            self.sync.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = env_value(OUTPUT_DIR_ENV) {
            self.sync.output_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn profile(&self) -> String {
        self.profile
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PROFILE)
            .to_string()
    }

    pub fn output_dir(&self) -> PathBuf {
        self.sync
            .output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR))
    }

    /// Where ledger streams live. Falls back to the platform data directory.
    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.sync.state_dir {
            return Ok(dir.clone());
        }
        let data = dirs::data_local_dir()
            .context("Couldn't determine a data directory; set sync.state_dir or MAIL_AGENT_STATE_DIR")?;
        Ok(data
            .join("mail_agent")
            .join("state"))
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Load the config file. An explicitly named file must exist; the default
/// one is optional.
pub fn get_config(file: &Option<PathBuf>) -> Result<Config> {
    let (path, explicit) = match file {
        Some(path) => (path.as_path(), true),
        None => (Path::new(DEFAULT_CONFIG_FILE), false),
    };

    let s = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("Couldn't read config file {}", path.display()))
        }
    };
    Config::from_toml_str(&s)
}

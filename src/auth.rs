//! Bearer credentials for the remote store.
//!
//! Token acquisition itself (browser login, device code, refresh tokens) lives
//! outside this crate. We either run a user supplied command that prints a
//! token on stdout, or read one from the environment.

use std::cell::RefCell;
use std::path::PathBuf;
use std::process::Command;

use tracing::debug;
use which::which;

use crate::config;
use crate::error::{Error, Result};

pub trait CredentialProvider {
    fn bearer_token(&self) -> Result<String>;

    /// Drop any cached token. Called after the remote store rejected one.
    fn invalidate(&self) {}
}

/// A fixed token, typically from `MAIL_AGENT_ACCESS_TOKEN`.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new<S: Into<String>>(token: S) -> Self {
        StaticToken(token.into())
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Runs an external program and uses its trimmed stdout as the token.
pub struct CommandToken {
    program: PathBuf,
    args: Vec<String>,
    cached: RefCell<Option<String>>,
}

impl CommandToken {
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| {
            Error::config_with_hint(
                "auth.token_command is empty",
                "Set token_command to a program and its arguments, e.g. [\"az\", \"account\", \"get-access-token\"].",
            )
        })?;
        let program = which(program).map_err(|e| {
            Error::config_with_hint(
                format!("token command '{}' not found: {}", program, e),
                "Install the program or use an absolute path in auth.token_command.",
            )
        })?;
        Ok(CommandToken {
            program,
            args: args.to_vec(),
            cached: RefCell::new(None),
        })
    }

    fn run(&self) -> Result<String> {
        debug!(program = %self.program.display(), "running token command");
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()?;
        if !output.status.success() {
            return Err(Error::ReauthRequired(format!(
                "token command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let token = String::from_utf8_lossy(&output.stdout)
            .trim()
            .to_string();
        if token.is_empty() {
            return Err(Error::ReauthRequired(
                "token command printed an empty token".to_string(),
            ));
        }
        Ok(token)
    }
}

impl CredentialProvider for CommandToken {
    fn bearer_token(&self) -> Result<String> {
        if let Some(token) = self.cached.borrow().as_ref() {
            return Ok(token.clone());
        }
        let token = self.run()?;
        *self.cached.borrow_mut() = Some(token.clone());
        Ok(token)
    }

    fn invalidate(&self) {
        self.cached
            .borrow_mut()
            .take();
    }
}

/// Pick a provider from the `[auth]` section. The command wins over the
/// environment variable.
pub fn from_config(auth: &config::Auth) -> Result<Box<dyn CredentialProvider>> {
    if let Some(command) = &auth.token_command {
        return Ok(Box::new(CommandToken::new(command)?));
    }

    match std::env::var(&auth.token_env) {
        Ok(token) if !token.trim().is_empty() => Ok(Box::new(StaticToken::new(token.trim()))),
        _ => Err(Error::config_with_hint(
            format!("no access token available (checked ${})", auth.token_env),
            format!(
                "Export {} or set auth.token_command in the config file.",
                auth.token_env
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_a_config_error() {
        let err = CommandToken::new(&[]).err().unwrap();
        assert_eq!(err.type_name(), "ConfigError");
        assert!(err.remediation().is_some());
    }

    #[test]
    fn missing_program_is_a_config_error() {
        let err = CommandToken::new(&["definitely-not-a-real-token-tool".to_string()])
            .err()
            .unwrap();
        assert_eq!(err.type_name(), "ConfigError");
    }

    #[cfg(unix)]
    #[test]
    fn command_output_is_trimmed_and_cached() {
        let provider =
            CommandToken::new(&["echo".to_string(), "  token-123  ".to_string()]).unwrap();
        assert_eq!(provider.bearer_token().unwrap(), "token-123");
        assert!(provider.cached.borrow().is_some());
        provider.invalidate();
        assert!(provider.cached.borrow().is_none());
    }

    #[test]
    fn unset_env_var_is_a_config_error() {
        let auth = config::Auth {
            token_command: None,
            token_env: "MAIL_AGENT_TEST_TOKEN_THAT_IS_NOT_SET".to_string(),
        };
        let err = from_config(&auth).err().unwrap();
        assert!(err.to_string().contains("MAIL_AGENT_TEST_TOKEN_THAT_IS_NOT_SET"));
    }
}

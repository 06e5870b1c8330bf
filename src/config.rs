//! Config module.
//!
//! This module contains the representation of the RT server
//! connection settings. Everything that used to be a module-level
//! constant (base URL, REST prefix, cookie file) lives here so
//! multiple target servers can be driven in isolation.

use serde::Deserialize;
use std::{env, path::PathBuf, result, time::Duration};
use thiserror::Error;

use crate::process;

pub const DEFAULT_REST_PATH: &str = "REST/1.0";
pub const DEFAULT_PASSWD_CMD: &str = "/usr/bin/security find-generic-password -w -s rt -a";
pub const DEFAULT_COOKIE_FILE: &str = "cookies.json";

/// The upstream server is known to be slow on large tickets, so the
/// default request timeout is generous but finite.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot fetch password from external command")]
    FetchPasswordError(#[source] process::Error),
    #[error("cannot fetch password: command output is empty")]
    FetchPasswordEmptyError,
    #[error("cannot expand cookie file path {1}")]
    ExpandCookieFileError(#[source] shellexpand::LookupError<env::VarError>, String),
}

pub type Result<T> = result::Result<T, Error>;

/// Represents the RT server connection settings.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RtConfig {
    /// Represents the base URL of the RT server.
    pub base_url: String,
    /// Represents the path of the legacy REST interface under the
    /// base URL.
    pub rest_path: String,
    /// Represents the user name used for authentication.
    pub user: String,
    /// Represents the command used to retrieve the user password.
    /// The user name is appended as the last argument.
    pub passwd_cmd: String,
    /// Represents the cookie file path. Shell variables and `~` are
    /// expanded.
    pub cookie_file: String,
    /// Represents an optional CA certificate bundle in PEM format,
    /// for servers with a private certificate chain.
    pub ca_cert: Option<PathBuf>,
    /// Represents the timeout applied to every request.
    pub timeout: Duration,
}

impl Default for RtConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            rest_path: DEFAULT_REST_PATH.into(),
            user: env::var("USER").unwrap_or_default(),
            passwd_cmd: DEFAULT_PASSWD_CMD.into(),
            cookie_file: default_cookie_file(),
            ca_cert: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

fn default_cookie_file() -> String {
    match dirs::data_dir() {
        Some(dir) => dir
            .join("rt-archive")
            .join(DEFAULT_COOKIE_FILE)
            .to_string_lossy()
            .into_owned(),
        None => DEFAULT_COOKIE_FILE.into(),
    }
}

impl RtConfig {
    /// Fetches the user password by running the configured external
    /// command. Trailing whitespace is trimmed from the output.
    pub fn password(&self) -> Result<String> {
        let cmd = format!("{} {}", self.passwd_cmd, self.user);
        let passwd = process::run_utf8(&cmd).map_err(Error::FetchPasswordError)?;
        let passwd = passwd.trim_end().to_owned();
        if passwd.is_empty() {
            return Err(Error::FetchPasswordEmptyError);
        }
        Ok(passwd)
    }

    /// Returns the expanded cookie file path.
    pub fn cookie_file(&self) -> Result<PathBuf> {
        let path = shellexpand::full(&self.cookie_file)
            .map_err(|err| Error::ExpandCookieFileError(err, self.cookie_file.clone()))?;
        Ok(PathBuf::from(path.into_owned()))
    }
}

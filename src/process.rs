//! Process module.
//!
//! This module contains cross platform helpers around the
//! `std::process` crate, used to run the external credential command.

use log::debug;
use std::{env, io, process::Command, result, string};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot spawn process for command {1:?}")]
    SpawnProcessError(#[source] io::Error, String),
    #[error("cannot parse command output")]
    ParseCmdOutputError(#[source] string::FromUtf8Error),
    #[error("command {0:?} failed with exit code {1}: {2}")]
    CmdStatusError(String, i32, String),
}

pub type Result<T> = result::Result<T, Error>;

/// Runs the given command through the shell and returns its raw
/// standard output. A non-zero exit status is an error carrying the
/// captured standard error.
pub fn run(cmd: &str) -> Result<Vec<u8>> {
    debug!("running command: {}", cmd);

    let windows = cfg!(target_os = "windows")
        && env::var("MSYSTEM")
            .map(|env| !env.starts_with("MINGW"))
            .unwrap_or_default();

    let output = if windows {
        Command::new("cmd").args(["/C", cmd]).output()
    } else {
        Command::new("sh").arg("-c").arg(cmd).output()
    }
    .map_err(|err| Error::SpawnProcessError(err, cmd.to_string()))?;

    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr)
            .trim_end()
            .to_string();
        return Err(Error::CmdStatusError(cmd.to_string(), code, stderr));
    }

    Ok(output.stdout)
}

/// Runs the given command and returns the output as UTF8 string.
pub fn run_utf8(cmd: &str) -> Result<String> {
    String::from_utf8(run(cmd)?).map_err(Error::ParseCmdOutputError)
}

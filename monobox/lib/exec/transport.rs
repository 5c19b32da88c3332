//! Wire-level command execution against a sandbox's backing pod.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::MonoboxError;
use crate::MonoboxResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Wrapper script run as `sh -c <wrapper> <working_dir> <command>`.
///
/// The working directory binds to `$0` and the command string to `$1`, so
/// user input travels as positional parameters instead of being spliced
/// into the script text.
const SHELL_WRAPPER: &str = r#"cd -- "$0" && eval "$1""#;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Captured result of one command run inside a sandbox.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Exit code reported by the container runtime.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Transport able to run commands in, and read logs from, a pod container.
#[async_trait]
pub trait ExecTransport: Send + Sync + 'static {
    /// Runs `argv` in `container` of `pod`, bounded by `timeout`.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
        timeout: Duration,
    ) -> MonoboxResult<ExecOutcome>;

    /// Fetches container logs, optionally limited to the last `tail_lines`.
    async fn logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> MonoboxResult<String>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExecOutcome {
    /// Whether the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the argv for running `command` with `working_dir` as its cwd.
pub fn shell_argv(command: &str, working_dir: &str) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        SHELL_WRAPPER.to_string(),
        working_dir.to_string(),
        command.to_string(),
    ]
}

/// Validates a caller-supplied working directory.
pub fn validate_working_dir(dir: &str) -> MonoboxResult<()> {
    if !dir.starts_with('/') {
        return Err(MonoboxError::InvalidWorkingDir(format!(
            "'{dir}' is not an absolute path"
        )));
    }
    if dir.chars().any(char::is_control) {
        return Err(MonoboxError::InvalidWorkingDir(
            "directory contains control characters".to_string(),
        ));
    }
    Ok(())
}

/// Quotes `value` for inclusion in a generated shell script.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

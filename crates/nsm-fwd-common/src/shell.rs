//! Shell command execution utilities.
//!
//! Switch and link primitives are driven through `ovs-vsctl`, `ovs-ofctl`
//! and `ip`. Every argument that comes from a request is passed through
//! [`shellquote`] before it reaches `/bin/sh`.
//!
//! Two flavours are provided: [`exec`] runs on the tokio runtime and is used
//! for switch commands, [`exec_blocking`] runs on the calling OS thread and is
//! used for link commands, which must inherit the namespace of a pinned
//! thread.
//!
//! # Example
//!
//! ```ignore
//! use nsm_fwd_common::shell::{self, OVS_VSCTL_CMD, shellquote};
//!
//! let cmd = format!("{} --may-exist add-br {}", OVS_VSCTL_CMD, shellquote("br-nsm"));
//! shell::exec_or_throw(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::{Output, Stdio};
use tokio::process::Command;

use crate::error::{FwdError, FwdResult};

/// Path to the `ip` command for network interface configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `ovs-vsctl` command for bridge and port configuration.
pub const OVS_VSCTL_CMD: &str = "/usr/bin/ovs-vsctl";

/// Path to the `ovs-ofctl` command for OpenFlow rules.
pub const OVS_OFCTL_CMD: &str = "/usr/bin/ovs-ofctl";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// Wraps the string in double quotes and escapes `$`, `` ` ``, `"`, `\`
/// and newline.
///
/// # Example
///
/// ```
/// use nsm_fwd_common::shell::shellquote;
///
/// assert_eq!(shellquote("tapsrc1"), "\"tapsrc1\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The stdout output, trimmed.
    pub stdout: String,
    /// The stderr output, trimmed.
    pub stderr: String,
}

impl ExecResult {
    fn from_output(output: Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    fn into_stdout(self, cmd: &str) -> FwdResult<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(FwdError::ShellCommandFailed {
                command: cmd.to_string(),
                exit_code: self.exit_code,
                output: self.combined_output(),
            })
        }
    }
}

fn log_result(cmd: &str, result: &ExecResult) {
    if result.success() {
        tracing::trace!(command = %cmd, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }
}

/// Executes a shell command asynchronously through `/bin/sh -c`.
///
/// Returns `Err` only if the command could not be spawned; a non-zero exit
/// is reported in the [`ExecResult`].
pub async fn exec(cmd: &str) -> FwdResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| FwdError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = ExecResult::from_output(output);
    log_result(cmd, &result);
    Ok(result)
}

/// Executes a shell command and returns an error on non-zero exit.
pub async fn exec_or_throw(cmd: &str) -> FwdResult<String> {
    exec(cmd).await?.into_stdout(cmd)
}

/// Executes a shell command on the calling OS thread.
///
/// The child process inherits the network namespace of the calling thread,
/// which is what link primitives running inside a namespace section need.
pub fn exec_blocking(cmd: &str) -> FwdResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command on current thread");

    let output = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| FwdError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = ExecResult::from_output(output);
    log_result(cmd, &result);
    Ok(result)
}

/// Blocking variant of [`exec_or_throw`].
pub fn exec_blocking_or_throw(cmd: &str) -> FwdResult<String> {
    exec_blocking(cmd)?.into_stdout(cmd)
}

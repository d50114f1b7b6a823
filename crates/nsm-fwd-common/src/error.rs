//! Error types for forwarder operations.
//!
//! This module defines the error types used throughout the forwarder crates.
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use thiserror::Error;

/// Result type alias for forwarder operations.
pub type FwdResult<T> = Result<T, FwdError>;

/// Errors that can occur while wiring or unwiring a cross-connect.
#[derive(Debug, Error)]
pub enum FwdError {
    /// Malformed cross-connect descriptor. Never retried.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Error message.
        message: String,
    },

    /// Pool exhausted or no candidate has a usable representor.
    #[error("No device available among candidates [{candidates}]")]
    NoDeviceAvailable {
        /// The candidate list that was scanned, comma separated.
        candidates: String,
    },

    /// Target namespace could not be opened or entered.
    #[error("Namespace '{netns}' unavailable: {message}")]
    NamespaceUnavailable {
        /// The namespace identifier (inode or path).
        netns: String,
        /// Error message.
        message: String,
    },

    /// A port or flow operation on the switch failed.
    #[error("Switch programming failed: {operation}: {message}")]
    SwitchProgrammingFailed {
        /// The operation that failed (e.g., "add-port", "add-flow").
        operation: String,
        /// Error message.
        message: String,
    },

    /// A representor or port id is not visible yet.
    #[error("Lookup of {what} failed after {attempts} attempts")]
    TransientLookupFailure {
        /// What was being looked up.
        what: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// A link primitive failed.
    #[error("Link operation failed on '{link}': {operation}: {message}")]
    Link {
        /// The link name or device id.
        link: String,
        /// The operation that failed.
        operation: String,
        /// Error message.
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    Config {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl FwdError {
    /// Creates an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a no device available error from the scanned candidates.
    pub fn no_device_available<S: AsRef<str>>(candidates: &[S]) -> Self {
        Self::NoDeviceAvailable {
            candidates: candidates
                .iter()
                .map(|c| c.as_ref())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Creates a namespace unavailable error.
    pub fn namespace_unavailable(netns: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NamespaceUnavailable {
            netns: netns.into(),
            message: message.into(),
        }
    }

    /// Creates a switch programming error.
    pub fn switch(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SwitchProgrammingFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a transient lookup failure.
    pub fn transient(what: impl Into<String>, attempts: u32) -> Self {
        Self::TransientLookupFailure {
            what: what.into(),
            attempts,
        }
    }

    /// Creates a link operation error.
    pub fn link(
        link: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Link {
            link: link.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FwdError::TransientLookupFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FwdError::no_device_available(&["0000:01:00.1", "0000:01:00.2"]);
        assert_eq!(
            err.to_string(),
            "No device available among candidates [0000:01:00.1,0000:01:00.2]"
        );
    }

    #[test]
    fn test_switch_error() {
        let err = FwdError::switch("add-flow", "bridge br-nsm does not exist");
        assert_eq!(
            err.to_string(),
            "Switch programming failed: add-flow: bridge br-nsm does not exist"
        );
    }

    #[test]
    fn test_shell_command_failed() {
        let err = FwdError::ShellCommandFailed {
            command: "ovs-vsctl del-port br-nsm tapsrc1".to_string(),
            exit_code: 1,
            output: "no port named tapsrc1".to_string(),
        };
        assert!(err.to_string().contains("ovs-vsctl del-port"));
        assert!(err.to_string().contains("exit code 1"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(FwdError::transient("ofport of tapsrc1", 5).is_retryable());
        assert!(!FwdError::invalid_request("missing id").is_retryable());
        assert!(!FwdError::no_device_available::<&str>(&[]).is_retryable());
    }
}

//! Error types for remote execution and synchronization

use std::fmt;
use thiserror::Error;

/// Why an in-flight invocation was aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's cancellation token fired
    Requested,
    /// The per-call deadline elapsed
    Deadline,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("cancelled by caller"),
            Self::Deadline => f.write_str("deadline exceeded"),
        }
    }
}

/// Errors raised by a command runner.
///
/// A remote command that runs and exits non-zero is not an error; it is
/// reported through the returned status. The only exception is
/// [`RunnerError::RemoteCommand`], which is produced when a caller opts in
/// via [`CommandOutput::into_result`](crate::CommandOutput::into_result).
#[derive(Debug, Error)]
pub enum RunnerError {
    /// A local process could not be started (missing binary, unreadable key, log file)
    #[error("[{target}] setup failed for `{command}`: {message}")]
    Setup {
        /// Node address
        target: String,
        /// Attempted command line or sync description
        command: String,
        /// What went wrong locally
        message: String,
    },

    /// The ssh transport itself failed (refused, timed out, authentication rejected)
    #[error("[{target}] connection failed (exit {status}) running `{command}`: {message}")]
    Connection {
        /// Node address
        target: String,
        /// Attempted command line or sync description
        command: String,
        /// Exit status of the local ssh/rsync client
        status: i32,
        /// Transport diagnostic from the client's stderr
        message: String,
    },

    /// The remote command exited non-zero and the caller asked for it to be raised
    #[error("[{target}] `{command}` exited with status {status}: {stderr}")]
    RemoteCommand {
        /// Node address
        target: String,
        /// Attempted command line
        command: String,
        /// Remote exit status
        status: i32,
        /// Captured standard error
        stderr: String,
    },

    /// The delta-transfer process failed
    #[error("[{target}] sync {src} -> {dst} failed{}: {output}", status_suffix(.status))]
    Sync {
        /// Node address
        target: String,
        /// Source path as given
        src: String,
        /// Destination path as given
        dst: String,
        /// rsync exit status, `None` when the transfer never started
        status: Option<i32>,
        /// Captured diagnostic output
        output: String,
    },

    /// An externally triggered cancellation aborted the call
    #[error("[{target}] `{command}` {reason}")]
    Cancelled {
        /// Node address
        target: String,
        /// Attempted command line or sync description
        command: String,
        /// Whether the caller or the deadline cancelled the call
        reason: CancelReason,
    },
}

fn status_suffix(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!(" (exit {})", code),
        None => String::new(),
    }
}

impl RunnerError {
    /// Check if error is worth retrying at the connection level
    pub fn is_retryable(&self) -> bool {
        matches!(self, RunnerError::Connection { .. })
    }

    /// Node address the error is attributed to
    pub fn target(&self) -> &str {
        match self {
            Self::Setup { target, .. }
            | Self::Connection { target, .. }
            | Self::RemoteCommand { target, .. }
            | Self::Sync { target, .. }
            | Self::Cancelled { target, .. } => target,
        }
    }
}

/// Diagnostics the OpenSSH client prints when the transport, not the
/// remote command, failed.
const TRANSPORT_DIAGNOSTICS: &[&str] = &[
    "connection refused",
    "connection timed out",
    "operation timed out",
    "could not resolve hostname",
    "no route to host",
    "network is unreachable",
    "permission denied (publickey",
    "host key verification failed",
    "connection closed by",
    "connection reset by",
    "kex_exchange_identification",
    "control socket connect",
    "mux_client_request_session",
];

/// Return the matching diagnostic line if `stderr` looks like a transport failure.
///
/// ssh exits 255 both when the connection fails and when the remote command
/// itself exits 255, so the exit code alone is not enough.
pub(crate) fn transport_failure(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .map(str::trim)
        .find(|line| {
            let lower = line.to_ascii_lowercase();
            TRANSPORT_DIAGNOSTICS.iter().any(|needle| lower.contains(needle))
        })
        .map(str::to_string)
}

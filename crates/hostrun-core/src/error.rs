//! Core error types for hostrun-core

use std::time::Duration;

use hostrun_exec::ExecError;
use thiserror::Error;

use crate::model::RunResponse;

/// Errors that can occur while running command sequences
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Could not establish or authenticate the shell
    #[error("connection failed: {0}")]
    Connection(String),

    /// No terminator was observed before the deadline
    #[error("command timed out after {timeout:?}: {command}")]
    Timeout {
        /// Command as logged (credentials unsubstituted)
        command: String,
        /// Deadline that was exceeded
        timeout: Duration,
        /// Output read before the deadline
        stdout: String,
    },

    /// An abort-on-match fragment appeared in the output
    #[error("encountered error fragment ({fragment}), command: {command}, stdout: {stdout}")]
    Pattern {
        /// Fragment that matched
        fragment: String,
        /// Command as logged
        command: String,
        /// Output that contained the fragment
        stdout: String,
    },

    /// None of the required fragments appeared in the output
    #[error("failed to match any of [{}], command: {command}, stdout: {stdout}", .fragments.join(","))]
    MissingSuccess {
        /// Fragments of which at least one was required
        fragments: Vec<String>,
        /// Command as logged
        command: String,
        /// Output that lacked them
        stdout: String,
    },

    /// An extraction rule failed
    #[error("extraction failed for key {key} with pattern {pattern}: {reason}")]
    Extraction {
        /// Key the rule writes to
        key: String,
        /// Rule pattern
        pattern: String,
        /// What went wrong
        reason: String,
    },

    /// A credential reference could not be resolved
    #[error("credential error: {0}")]
    Credential(String),

    /// Target URL scheme or shape is not supported
    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),

    /// Request failed validation
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The shell transport failed after the session was established
    #[error("transport error: {0}")]
    Transport(String),
}

impl CoreError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Connection(_) | CoreError::Timeout { .. })
    }

    /// Output captured by the failing command, if any
    #[must_use]
    pub fn stdout(&self) -> &str {
        match self {
            CoreError::Timeout { stdout, .. }
            | CoreError::Pattern { stdout, .. }
            | CoreError::MissingSuccess { stdout, .. } => stdout,
            _ => "",
        }
    }

    /// Map a transport error raised while running `command`
    ///
    /// `command` is the form safe to log; the text the transport saw may
    /// hold substituted secrets and is never echoed back.
    pub(crate) fn from_exec(err: ExecError, command: &str) -> Self {
        match err {
            ExecError::Timeout { timeout, partial } => CoreError::Timeout {
                command: command.to_string(),
                timeout,
                stdout: partial,
            },
            ExecError::Replay(reason) => {
                CoreError::Transport(format!("replay: {reason}: {command}"))
            }
            other => other.into(),
        }
    }
}

impl From<ExecError> for CoreError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::ConnectionFailed(_)
            | ExecError::AuthenticationFailed(_)
            | ExecError::SshKeyError(_)
            | ExecError::SpawnError(_) => CoreError::Connection(err.to_string()),
            ExecError::Timeout { timeout, partial } => CoreError::Timeout {
                command: String::new(),
                timeout,
                stdout: partial,
            },
            ExecError::IoError(_) | ExecError::SessionClosed | ExecError::Replay(_) => {
                CoreError::Transport(err.to_string())
            }
        }
    }
}

/// A failed `run`/`extract`, carrying the log of everything executed so far
#[derive(Error, Debug, Clone)]
#[error("command sequence aborted after {} command(s)", .response.cmd.len())]
pub struct RunFailure {
    /// What stopped the sequence
    #[source]
    pub error: CoreError,
    /// Commands executed before and including the failing one
    pub response: RunResponse,
}

impl RunFailure {
    /// Wrap an error with the response accumulated so far
    #[must_use]
    pub fn new(error: CoreError, response: RunResponse) -> Self {
        Self { error, response }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_errors_map_to_core_taxonomy() {
        let err: CoreError = ExecError::AuthenticationFailed("denied".into()).into();
        assert!(matches!(err, CoreError::Connection(_)));
        assert!(err.is_retryable());

        let err: CoreError = ExecError::SessionClosed.into();
        assert!(matches!(err, CoreError::Transport(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_timeout_keeps_logged_command() {
        let err = CoreError::from_exec(
            ExecError::Timeout {
                timeout: Duration::from_secs(1),
                partial: "compiling".to_string(),
            },
            "make build",
        );
        assert!(err.to_string().contains("make build"));
        assert_eq!(err.stdout(), "compiling");
    }

    #[test]
    fn test_replay_miss_reports_logged_command() {
        let err = CoreError::from_exec(
            ExecError::Replay("unexpected command".to_string()),
            "mysql -p**pw**",
        );
        assert!(matches!(err, CoreError::Transport(_)));
        assert_eq!(
            err.to_string(),
            "transport error: replay: unexpected command: mysql -p**pw**"
        );
    }

    #[test]
    fn test_missing_success_lists_fragments() {
        let err = CoreError::MissingSuccess {
            fragments: vec!["BUILD SUCCESS".into(), "OK".into()],
            command: "mvn package".into(),
            stdout: "BUILD FAILURE".into(),
        };
        assert!(err.to_string().contains("BUILD SUCCESS,OK"));
    }
}

//! Error types for hostrun-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while driving a shell transport
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// No terminator was observed before the deadline
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
        /// Output accumulated before the deadline
        partial: String,
    },

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Process spawn error
    #[error("failed to spawn shell: {0}")]
    SpawnError(String),

    /// I/O error while reading or writing the shell stream
    #[error("I/O error: {0}")]
    IoError(String),

    /// The shell stream ended
    #[error("shell session closed")]
    SessionClosed,

    /// Replayed session received a command that is not in its script
    #[error("replay: {0}")]
    Replay(String),
}

impl ExecError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_) | ExecError::Timeout { .. }
        )
    }

    /// Output captured before the failure, if any
    #[must_use]
    pub fn partial_output(&self) -> &str {
        match self {
            ExecError::Timeout { partial, .. } => partial,
            _ => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_retryable_and_keeps_partial() {
        let err = ExecError::Timeout {
            timeout: Duration::from_millis(100),
            partial: "half".to_string(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.partial_output(), "half");
        assert!(!err.to_string().contains("half"));
    }

    #[test]
    fn test_closed_is_not_retryable() {
        assert!(!ExecError::SessionClosed.is_retryable());
        assert_eq!(ExecError::SessionClosed.partial_output(), "");
    }
}

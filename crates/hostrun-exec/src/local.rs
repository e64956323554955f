//! Local shell transport using `tokio::process`

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, instrument};

use crate::auth::{AuthConfig, Endpoint};
use crate::error::ExecError;
use crate::stream::{SHELL_PROMPT, ShellStream};
use crate::traits::{Connector, Transport};

/// Opens an interactive `sh` on the local machine
///
/// Used for `file://` targets. The shell has no terminal, so commands that
/// insist on reading from a TTY (such as `sudo` password prompts) will not
/// behave as they do over SSH.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    ready_timeout: Duration,
}

impl LocalConnector {
    /// Create a new local connector
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for LocalConnector {
    #[instrument(skip(self, _endpoint, _auth), level = "debug")]
    async fn connect(
        &self,
        _endpoint: &Endpoint,
        _auth: &AuthConfig,
    ) -> Result<Box<dyn Transport>, ExecError> {
        Ok(Box::new(LocalTransport::spawn(self.ready_timeout).await?))
    }
}

/// Local interactive shell
pub struct LocalTransport {
    child: Option<Child>,
    stream: ShellStream,
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .finish_non_exhaustive()
    }
}

impl LocalTransport {
    /// Start the shell and wait until it reports ready
    ///
    /// # Errors
    /// Returns `ExecError::SpawnError` if `sh` cannot be started
    pub async fn spawn(ready_timeout: Duration) -> Result<Self, ExecError> {
        // stderr is folded into stdout so prompts and errors share one stream
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("exec sh -i 2>&1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecError::SpawnError("shell stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::SpawnError("shell stdout unavailable".to_string()))?;

        let mut stream = ShellStream::spawn(stdout, stdin);
        stream.prepare("", ready_timeout).await?;

        info!(pid = ?child.id(), "local shell ready");

        Ok(Self {
            child: Some(child),
            stream,
        })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    #[instrument(skip(self, command, terminators), level = "debug")]
    async fn run(
        &mut self,
        command: &str,
        timeout_duration: Duration,
        terminators: &[String],
    ) -> Result<String, ExecError> {
        if self.child.is_none() {
            return Err(ExecError::SessionClosed);
        }

        debug!(timeout = ?timeout_duration, "executing local command");

        let result = self
            .stream
            .exchange(command, timeout_duration, terminators)
            .await;
        if let Err(ExecError::Timeout { timeout, .. }) = &result {
            error!(timeout = ?timeout, "local command timed out");
        }
        result
    }

    fn system(&self) -> &str {
        match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        }
    }

    fn shell_prompt(&self) -> &str {
        SHELL_PROMPT
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        if let Some(mut child) = self.child.take() {
            let _ = self.stream.send_line("exit").await;
            if tokio::time::timeout(Duration::from_secs(2), child.wait())
                .await
                .is_err()
            {
                child
                    .kill()
                    .await
                    .map_err(|e| ExecError::IoError(e.to_string()))?;
            }
            debug!("local shell closed");
        }
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "local"
    }
}

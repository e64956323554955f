//! Scripted shell sessions for deterministic tests
//!
//! A [`ReplayScript`] lists the commands a session is expected to receive and
//! the output each one produces. [`ReplayTransport`] plays a script back;
//! [`RecordingTransport`] wraps a live transport and captures one.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{AuthConfig, Endpoint};
use crate::error::ExecError;
use crate::stream::SHELL_PROMPT;
use crate::traits::{Connector, Transport};

/// File name looked up inside a replay directory
pub const REPLAY_FILE: &str = "replay.json";

/// One recorded command and its output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayCommand {
    /// Command as sent to the shell
    pub stdin: String,
    /// Output the shell produced
    #[serde(default)]
    pub stdout: String,
    /// Simulate a command that never reaches a terminator
    #[serde(default)]
    pub timeout: bool,
}

/// A scripted session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayScript {
    /// OS family the fake shell reports
    #[serde(default = "default_system")]
    pub system: String,
    /// Prompt the fake shell reports
    #[serde(default = "default_prompt")]
    pub shell_prompt: String,
    /// Commands in recording order
    #[serde(default)]
    pub commands: Vec<ReplayCommand>,
}

fn default_system() -> String {
    "linux".to_string()
}

fn default_prompt() -> String {
    SHELL_PROMPT.to_string()
}

impl Default for ReplayScript {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayScript {
    /// Create an empty linux script
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: default_system(),
            shell_prompt: default_prompt(),
            commands: Vec::new(),
        }
    }

    /// Set the reported OS family
    #[must_use]
    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    /// Add a command/output pair
    #[must_use]
    pub fn respond(mut self, stdin: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.commands.push(ReplayCommand {
            stdin: stdin.into(),
            stdout: stdout.into(),
            timeout: false,
        });
        self
    }

    /// Add a command that hangs until the caller's deadline
    #[must_use]
    pub fn hang(mut self, stdin: impl Into<String>) -> Self {
        self.commands.push(ReplayCommand {
            stdin: stdin.into(),
            stdout: String::new(),
            timeout: true,
        });
        self
    }

    /// Load a script from a JSON file
    ///
    /// # Errors
    /// Returns `ExecError::Replay` if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, ExecError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ExecError::Replay(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| ExecError::Replay(format!("failed to parse {}: {e}", path.display())))
    }

    /// Load `replay.json` from a directory
    ///
    /// # Errors
    /// See [`ReplayScript::load`]
    pub fn from_dir(basedir: &Path) -> Result<Self, ExecError> {
        Self::load(&basedir.join(REPLAY_FILE))
    }

    /// Write the script as pretty JSON
    ///
    /// # Errors
    /// Returns `ExecError::IoError` if the file cannot be written
    pub fn store(&self, path: &Path) -> Result<(), ExecError> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| ExecError::IoError(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| ExecError::IoError(e.to_string()))
    }
}

/// Commands a replay transport has received, shared with the test
#[derive(Debug, Clone, Default)]
pub struct ReplayHistory {
    sent: Arc<Mutex<Vec<String>>>,
}

impl ReplayHistory {
    fn push(&self, command: &str) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(command.to_string());
        }
    }

    /// Every command received, in order
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of times `command` was received
    #[must_use]
    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }
}

/// Plays back a [`ReplayScript`]
///
/// Responses for a command are consumed in order; the last one repeats.
#[derive(Debug)]
pub struct ReplayTransport {
    system: String,
    shell_prompt: String,
    responses: HashMap<String, VecDeque<ReplayCommand>>,
    history: ReplayHistory,
    closed: bool,
}

impl ReplayTransport {
    /// Create a transport from a script
    #[must_use]
    pub fn new(script: ReplayScript) -> Self {
        Self::with_history(script, ReplayHistory::default())
    }

    /// Create a transport that records into an existing history
    #[must_use]
    pub fn with_history(script: ReplayScript, history: ReplayHistory) -> Self {
        let mut responses: HashMap<String, VecDeque<ReplayCommand>> = HashMap::new();
        for command in script.commands {
            responses
                .entry(command.stdin.clone())
                .or_default()
                .push_back(command);
        }
        Self {
            system: script.system,
            shell_prompt: script.shell_prompt,
            responses,
            history,
            closed: false,
        }
    }

    /// Handle to the commands received so far
    #[must_use]
    pub fn history(&self) -> ReplayHistory {
        self.history.clone()
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn run(
        &mut self,
        command: &str,
        timeout: Duration,
        _terminators: &[String],
    ) -> Result<String, ExecError> {
        if self.closed {
            return Err(ExecError::SessionClosed);
        }
        self.history.push(command);

        // the command may hold substituted secrets: never echo it in errors or logs
        let queue = self
            .responses
            .get_mut(command)
            .ok_or_else(|| ExecError::Replay("unexpected command".to_string()))?;
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
        .ok_or_else(|| ExecError::Replay("no response left".to_string()))?;

        debug!(bytes = response.stdout.len(), "replaying response");
        if response.timeout {
            return Err(ExecError::Timeout {
                timeout,
                partial: response.stdout,
            });
        }
        Ok(response.stdout)
    }

    fn system(&self) -> &str {
        &self.system
    }

    fn shell_prompt(&self) -> &str {
        &self.shell_prompt
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        self.closed = true;
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "replay"
    }
}

/// Connector handing out replay transports keyed by host
#[derive(Debug, Clone, Default)]
pub struct ReplayConnector {
    scripts: HashMap<String, ReplayScript>,
    histories: Arc<Mutex<HashMap<String, ReplayHistory>>>,
}

impl ReplayConnector {
    /// Create a connector with no scripts
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the script served for `host`
    #[must_use]
    pub fn with_script(mut self, host: impl Into<String>, script: ReplayScript) -> Self {
        self.scripts.insert(host.into(), script);
        self
    }

    /// Commands received by transports for `host`
    #[must_use]
    pub fn history(&self, host: &str) -> ReplayHistory {
        let mut histories = match self.histories.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        histories.entry(host.to_string()).or_default().clone()
    }

    /// Whether a transport for `host` was ever handed out
    #[must_use]
    pub fn has_connected(&self, host: &str) -> bool {
        self.histories
            .lock()
            .map(|h| h.contains_key(host))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Connector for ReplayConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _auth: &AuthConfig,
    ) -> Result<Box<dyn Transport>, ExecError> {
        let script = self.scripts.get(&endpoint.host).cloned().ok_or_else(|| {
            ExecError::ConnectionFailed(format!("no replay script for {}", endpoint.host))
        })?;
        let history = self.history(&endpoint.host);
        Ok(Box::new(ReplayTransport::with_history(script, history)))
    }
}

/// Wraps a live transport and captures every exchange into a script
///
/// The script is written to `path` when the transport is closed. Commands are
/// captured exactly as sent, so a recording may contain substituted secrets
/// and must be stored accordingly.
pub struct RecordingTransport {
    inner: Box<dyn Transport>,
    script: ReplayScript,
    path: PathBuf,
}

impl std::fmt::Debug for RecordingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingTransport")
            .field("path", &self.path)
            .field("recorded", &self.script.commands.len())
            .finish_non_exhaustive()
    }
}

impl RecordingTransport {
    /// Record `inner` into `path`
    pub fn new(inner: Box<dyn Transport>, path: impl Into<PathBuf>) -> Self {
        let script = ReplayScript {
            system: inner.system().to_string(),
            shell_prompt: inner.shell_prompt().to_string(),
            commands: Vec::new(),
        };
        Self {
            inner,
            script,
            path: path.into(),
        }
    }

    /// Script captured so far
    #[must_use]
    pub fn script(&self) -> &ReplayScript {
        &self.script
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn run(
        &mut self,
        command: &str,
        timeout: Duration,
        terminators: &[String],
    ) -> Result<String, ExecError> {
        let result = self.inner.run(command, timeout, terminators).await;
        let entry = match &result {
            Ok(stdout) => Some(ReplayCommand {
                stdin: command.to_string(),
                stdout: stdout.clone(),
                timeout: false,
            }),
            Err(ExecError::Timeout { partial, .. }) => Some(ReplayCommand {
                stdin: command.to_string(),
                stdout: partial.clone(),
                timeout: true,
            }),
            Err(_) => None,
        };
        if let Some(entry) = entry {
            self.script.commands.push(entry);
        }
        result
    }

    fn system(&self) -> &str {
        self.inner.system()
    }

    fn shell_prompt(&self) -> &str {
        self.inner.shell_prompt()
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        let closed = self.inner.close().await;
        match self.script.store(&self.path) {
            Ok(()) => info!(
                path = %self.path.display(),
                commands = self.script.commands.len(),
                "stored session recording"
            ),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to store recording"),
        }
        closed
    }

    fn transport_type(&self) -> &'static str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> Vec<String> {
        vec![SHELL_PROMPT.to_string()]
    }

    #[tokio::test]
    async fn test_replay_serves_responses_in_order() {
        let script = ReplayScript::new()
            .respond("whoami", "alice")
            .respond("whoami", "root");
        let mut transport = ReplayTransport::new(script);
        let timeout = Duration::from_secs(1);

        assert_eq!(transport.run("whoami", timeout, &prompt()).await.unwrap(), "alice");
        assert_eq!(transport.run("whoami", timeout, &prompt()).await.unwrap(), "root");
        // last response repeats
        assert_eq!(transport.run("whoami", timeout, &prompt()).await.unwrap(), "root");
        assert_eq!(transport.history().count("whoami"), 3);
    }

    #[tokio::test]
    async fn test_replay_rejects_unknown_command() {
        let mut transport = ReplayTransport::new(ReplayScript::new());
        let err = transport
            .run("mysql -pTOPSECRET", Duration::from_secs(1), &prompt())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Replay(_)));
        assert!(!err.to_string().contains("TOPSECRET"));
    }

    #[tokio::test]
    async fn test_replay_hang_is_timeout() {
        let mut transport = ReplayTransport::new(ReplayScript::new().hang("sleep 100"));
        let result = transport
            .run("sleep 100", Duration::from_millis(10), &prompt())
            .await;
        assert!(matches!(result, Err(ExecError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_connector_shares_history_per_host() {
        let connector = ReplayConnector::new()
            .with_script("10.0.0.1", ReplayScript::new().respond("uptime", "up 3 days"));

        let mut transport = connector
            .connect(&Endpoint::new("10.0.0.1"), &AuthConfig::default())
            .await
            .unwrap();
        transport
            .run("uptime", Duration::from_secs(1), &prompt())
            .await
            .unwrap();

        assert!(connector.has_connected("10.0.0.1"));
        assert_eq!(connector.history("10.0.0.1").commands(), vec!["uptime"]);
        assert!(
            connector
                .connect(&Endpoint::new("10.0.0.2"), &AuthConfig::default())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_recording_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(REPLAY_FILE);
        let live = ReplayTransport::new(
            ReplayScript::new()
                .system("darwin")
                .respond("uname -m", "x86_64"),
        );

        let mut recorder = RecordingTransport::new(Box::new(live), &path);
        recorder
            .run("uname -m", Duration::from_secs(1), &prompt())
            .await
            .unwrap();
        recorder.close().await.unwrap();

        let stored = ReplayScript::from_dir(dir.path()).unwrap();
        assert_eq!(stored.system, "darwin");
        assert_eq!(stored.commands.len(), 1);
        assert_eq!(stored.commands[0].stdout, "x86_64");
    }
}

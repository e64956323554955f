//! One live shell on one host, plus the state mirrored from it

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hostrun_exec::{SHELL_PROMPT, Transport};
use tracing::{debug, info, instrument, warn};

use crate::classify::Reset;
use crate::error::CoreError;
use crate::model::{COMMAND_NOT_FOUND, NO_SUCH_FILE_OR_DIRECTORY};
use crate::os::{DaemonType, OperatingSystem};

/// Live shell with its tracked directory, exports and host facts
pub struct TerminalSession {
    id: String,
    transport: Box<dyn Transport>,
    current_directory: Option<String>,
    env: BTreeMap<String, String>,
    operating_system: Option<OperatingSystem>,
    daemon_type: Option<DaemonType>,
    internal_timeout: Duration,
    opened_at: DateTime<Utc>,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("transport", &self.transport.transport_type())
            .field("current_directory", &self.current_directory)
            .field("opened_at", &self.opened_at)
            .finish_non_exhaustive()
    }
}

/// Whether output reports a missing path
fn reports_missing_path(stdout: &str) -> bool {
    stdout.to_lowercase().contains(NO_SUCH_FILE_OR_DIRECTORY)
}

/// Collapse a file path to its directory and drop trailing slashes
fn normalize_directory(directory: &str) -> Option<String> {
    let directory = directory.trim();
    let (parent, name) = match directory.rfind('/') {
        Some(i) => (&directory[..=i], &directory[i + 1..]),
        None => ("", directory),
    };
    let directory = if std::path::Path::new(name).extension().is_some() {
        parent
    } else {
        directory
    };
    let trimmed = directory.trim_end_matches('/');
    match (trimmed.is_empty(), directory.starts_with('/')) {
        (false, _) => Some(trimmed.to_string()),
        (true, true) => Some("/".to_string()),
        (true, false) => None,
    }
}

impl TerminalSession {
    /// Wrap an established transport
    pub fn new(id: impl Into<String>, transport: Box<dyn Transport>, internal_timeout: Duration) -> Self {
        Self {
            id: id.into(),
            transport,
            current_directory: None,
            env: BTreeMap::new(),
            operating_system: None,
            daemon_type: None,
            internal_timeout,
            opened_at: Utc::now(),
        }
    }

    /// Registry key
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the shell was opened
    #[must_use]
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Directory the shell is known to be in
    #[must_use]
    pub fn current_directory(&self) -> Option<&str> {
        self.current_directory.as_deref()
    }

    /// Value last exported for `key`
    #[must_use]
    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Prompt of the unprivileged shell
    #[must_use]
    pub fn shell_prompt(&self) -> &str {
        self.transport.shell_prompt()
    }

    /// Prompt shown by a root shell opened from this one
    #[must_use]
    pub fn elevated_prompt(&self) -> String {
        let prompt = self.shell_prompt().replacen('$', "#", 1);
        if prompt.contains("bash") {
            prompt.chars().skip(2).collect()
        } else {
            prompt
        }
    }

    /// Prompts that end any read: the default prompt and its elevated form
    #[must_use]
    pub fn prompt_terminators(&self) -> Vec<String> {
        let mut terminators = vec![SHELL_PROMPT.to_string()];
        let elevated = self.elevated_prompt();
        if !elevated.is_empty() && !terminators.contains(&elevated) {
            terminators.push(elevated);
        }
        terminators
    }

    /// Send a command and read until a terminator
    ///
    /// # Errors
    /// Returns `CoreError::Timeout` when no terminator arrives in time and
    /// `CoreError::Transport` when the shell fails
    pub async fn run(
        &mut self,
        command: &str,
        logged_as: &str,
        timeout: Duration,
        terminators: &[String],
    ) -> Result<String, CoreError> {
        debug!(session = %self.id, command = %logged_as, "sending command");
        self.transport
            .run(command, timeout, terminators)
            .await
            .map_err(|e| CoreError::from_exec(e, logged_as))
    }

    /// Run a bookkeeping command with the internal timeout
    async fn run_internal(&mut self, command: &str) -> Result<String, CoreError> {
        let terminators = self.prompt_terminators();
        let timeout = self.internal_timeout;
        self.run(command, command, timeout, &terminators).await
    }

    /// Change directory unless already there
    ///
    /// Returns whether a `cd` was sent.
    ///
    /// # Errors
    /// Propagates transport failures
    pub async fn change_directory(&mut self, directory: &str) -> Result<bool, CoreError> {
        let Some(directory) = normalize_directory(directory) else {
            return Ok(false);
        };
        if self.current_directory.as_deref() == Some(directory.as_str()) {
            return Ok(false);
        }

        let stdout = self.run_internal(&format!("cd {directory}")).await?;
        if reports_missing_path(&stdout) {
            warn!(session = %self.id, directory = %directory, "directory does not exist");
        } else {
            self.current_directory = Some(directory);
        }
        Ok(true)
    }

    /// Export a variable unless it already holds `value`
    ///
    /// Returns whether an `export` was sent.
    ///
    /// # Errors
    /// Propagates transport failures
    pub async fn set_env(&mut self, key: &str, value: &str) -> Result<bool, CoreError> {
        if self.env.get(key).is_some_and(|v| v == value) {
            return Ok(false);
        }
        self.run_internal(&format!("export {key}='{}'", value.replace('\'', r"'\''")))
            .await?;
        self.env.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    /// Forget tracked state after a verbatim command changed it
    pub fn reset(&mut self, reset: Reset) {
        match reset {
            Reset::Directory => self.current_directory = None,
            Reset::Env => self.env.clear(),
        }
    }

    /// Host facts, detected on first use
    ///
    /// # Errors
    /// Never fails on a probe; failed probes leave their fields empty
    pub async fn operating_system(&mut self) -> Result<&mut OperatingSystem, CoreError> {
        if self.operating_system.is_none() {
            let detected = self.detect_operating_system().await;
            self.operating_system = Some(detected);
        }
        self.operating_system
            .as_mut()
            .ok_or_else(|| CoreError::Transport("operating system unavailable".to_string()))
    }

    /// Probe output, or `None` after logging a tolerated failure
    async fn probe(&mut self, command: &str) -> Option<String> {
        match self.run_internal(command).await {
            Ok(stdout) => Some(stdout),
            Err(e) => {
                warn!(session = %self.id, probe = %command, error = %e, "probe failed");
                None
            }
        }
    }

    #[instrument(skip(self), fields(session = %self.id))]
    async fn detect_operating_system(&mut self) -> OperatingSystem {
        let mut os = OperatingSystem {
            system: self.transport.system().to_string(),
            ..Default::default()
        };

        let release = if os.system == "darwin" {
            "sw_vers"
        } else {
            "lsb_release -a"
        };
        if let Some(out) = self.probe(release).await {
            os.apply_release(&out);
        }
        if let Some(out) = self.probe("uname -m").await {
            os.apply_hardware(&out);
        }
        if let Some(out) = self.probe("echo $PATH").await {
            os.apply_path(&out);
        }
        if let Some(out) = self.probe("echo $USER").await {
            os.user = out.trim().to_string();
        }

        info!(
            system = %os.system,
            name = %os.name,
            version = %os.version,
            architecture = %os.architecture,
            "operating system detected"
        );
        os
    }

    /// Service manager, probed on first use
    ///
    /// # Errors
    /// Never fails on a probe; failed probes are skipped
    pub async fn daemon_type(&mut self) -> Result<DaemonType, CoreError> {
        if let Some(found) = self.daemon_type {
            return Ok(found);
        }

        let mut detected = DaemonType::Unknown;
        for (kind, command) in DaemonType::PROBES {
            let Some(stdout) = self.probe(command).await else {
                continue;
            };
            let lower = stdout.to_lowercase();
            if !lower.contains(COMMAND_NOT_FOUND) && !lower.contains(NO_SUCH_FILE_OR_DIRECTORY) {
                detected = kind;
                break;
            }
        }

        debug!(session = %self.id, daemon = %detected, "daemon type detected");
        self.daemon_type = Some(detected);
        Ok(detected)
    }

    /// Close the shell
    ///
    /// # Errors
    /// Propagates transport failures
    pub async fn close(&mut self) -> Result<(), CoreError> {
        self.transport.close().await?;
        info!(session = %self.id, "session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use hostrun_exec::{ReplayScript, ReplayTransport};

    use super::*;

    fn session(script: ReplayScript) -> (TerminalSession, hostrun_exec::ReplayHistory) {
        let transport = ReplayTransport::new(script);
        let history = transport.history();
        (
            TerminalSession::new("h:22", Box::new(transport), Duration::from_secs(1)),
            history,
        )
    }

    #[test]
    fn test_normalize_directory() {
        assert_eq!(normalize_directory("/opt/app/"), Some("/opt/app".to_string()));
        assert_eq!(normalize_directory("/opt/app/run.sh"), Some("/opt/app".to_string()));
        assert_eq!(normalize_directory("/home/u/.config"), Some("/home/u/.config".to_string()));
        assert_eq!(normalize_directory("/"), Some("/".to_string()));
        assert_eq!(normalize_directory(""), None);
    }

    #[test]
    fn test_elevated_prompt() {
        let (session, _) = session(ReplayScript::new());
        assert_eq!(session.elevated_prompt(), "# ");
        assert_eq!(session.prompt_terminators(), vec!["$ ".to_string(), "# ".to_string()]);
    }

    #[tokio::test]
    async fn test_cd_is_deduplicated() {
        let (mut session, history) = session(ReplayScript::new().respond("cd /opt", ""));
        assert!(session.change_directory("/opt").await.unwrap());
        assert!(!session.change_directory("/opt/").await.unwrap());
        assert_eq!(history.count("cd /opt"), 1);
        assert_eq!(session.current_directory(), Some("/opt"));
    }

    #[tokio::test]
    async fn test_missing_directory_is_not_tracked() {
        let (mut session, _) = session(
            ReplayScript::new().respond("cd /nope", "sh: cd: /nope: No such file or directory"),
        );
        session.change_directory("/nope").await.unwrap();
        assert_eq!(session.current_directory(), None);
    }

    #[tokio::test]
    async fn test_export_is_deduplicated_and_reset() {
        let (mut session, history) =
            session(ReplayScript::new().respond("export GOPATH='/go'", ""));
        assert!(session.set_env("GOPATH", "/go").await.unwrap());
        assert!(!session.set_env("GOPATH", "/go").await.unwrap());
        session.reset(Reset::Env);
        assert!(session.set_env("GOPATH", "/go").await.unwrap());
        assert_eq!(history.count("export GOPATH='/go'"), 2);
    }

    #[tokio::test]
    async fn test_failed_probe_leaves_fields_empty() {
        let (mut session, _) = session(
            ReplayScript::new()
                .respond("uname -m", "x86_64")
                .respond("echo $PATH", "/usr/bin:/bin")
                .respond("echo $USER", "deploy"),
        );
        let os = session.operating_system().await.unwrap();
        assert_eq!(os.name, "");
        assert_eq!(os.architecture, "amd64");
        assert_eq!(os.user, "deploy");
        assert_eq!(os.path.env_value(), "/usr/bin:/bin");
    }

    #[tokio::test]
    async fn test_daemon_type_probes_in_order_and_caches() {
        let (mut session, history) = session(
            ReplayScript::new()
                .respond("launchctl version", "bash: launchctl: command not found")
                .respond("service --version", "service ver. 1.1"),
        );
        assert_eq!(session.daemon_type().await.unwrap(), DaemonType::Service);
        assert_eq!(session.daemon_type().await.unwrap(), DaemonType::Service);
        assert_eq!(history.count("launchctl version"), 1);
        assert_eq!(history.count("systemctl --version"), 0);
    }
}

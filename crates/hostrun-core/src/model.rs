//! Request, execution and response types

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CoreError;

/// Fragment reported by shells for unknown commands
pub const COMMAND_NOT_FOUND: &str = "command not found";
/// Fragment reported for missing paths
pub const NO_SUCH_FILE_OR_DIRECTORY: &str = "no such file or directory";
/// Fragment some tools print when they give up
pub const ERROR_IS_NOT_RECOVERABLE: &str = "Error is not recoverable";

/// Host the engine runs commands on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// `ssh://host[:port]/dir`, `scp://...` or `file:///dir`
    pub url: String,
    /// Credential reference used to authenticate and to answer `sudo`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

impl Target {
    /// Create a target without credentials
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
        }
    }

    /// Set the credential reference
    #[must_use]
    pub fn with_credentials(mut self, reference: impl Into<String>) -> Self {
        self.credentials = Some(reference.into());
        self
    }

    /// Parse the URL into a connectable address
    ///
    /// # Errors
    /// Returns `CoreError::UnsupportedTarget` for unparsable URLs or schemes
    /// other than `ssh`, `scp` and `file`
    pub fn address(&self) -> Result<TargetAddress, CoreError> {
        let parsed = Url::parse(&self.url)
            .map_err(|e| CoreError::UnsupportedTarget(format!("{}: {e}", self.url)))?;
        let scheme = match parsed.scheme() {
            "ssh" | "scp" => Scheme::Ssh,
            "file" => Scheme::Local,
            other => {
                return Err(CoreError::UnsupportedTarget(format!(
                    "invalid scheme: {other} in url: {}",
                    self.url
                )));
            }
        };
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_HOST)
            .to_string();
        let directory = match parsed.path() {
            "" | "/" => None,
            path => Some(path.to_string()),
        };
        let username = match parsed.username() {
            "" => None,
            user => Some(user.to_string()),
        };
        Ok(TargetAddress {
            scheme,
            host,
            port: parsed.port().unwrap_or(DEFAULT_SSH_PORT),
            directory,
            username,
        })
    }
}

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_SSH_PORT: u16 = 22;

/// Transport family selected by the URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// `ssh://` and `scp://`
    Ssh,
    /// `file://`
    Local,
}

impl Scheme {
    /// Canonical scheme name used to look up connectors
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Ssh => "ssh",
            Scheme::Local => "file",
        }
    }
}

/// Parsed form of a [`Target`] URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    /// Transport family
    pub scheme: Scheme,
    /// Host name or address
    pub host: String,
    /// SSH port
    pub port: u16,
    /// Initial working directory from the URL path
    pub directory: Option<String>,
    /// Login user embedded in the URL
    pub username: Option<String>,
}

impl TargetAddress {
    /// Key under which the session for this address is registered
    #[must_use]
    pub fn session_id(&self) -> String {
        match self.scheme {
            Scheme::Ssh => format!("{}:{}", self.host, self.port),
            Scheme::Local => format!("file://{}", self.host),
        }
    }
}

/// Settings shared by every execution in a sequence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Directories pushed to the front of `PATH`
    pub system_paths: Vec<String>,
    /// Extra strings that end a read
    pub terminators: Vec<String>,
    /// Per-command timeout; `0` uses the engine default
    pub timeout_ms: u64,
    /// Directory to change into before the first execution
    pub directory: Option<String>,
    /// Variables exported before the first execution
    pub env: BTreeMap<String, String>,
}

impl ExecutionOptions {
    /// Set the working directory
    #[must_use]
    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Add an exported variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a `PATH` entry
    #[must_use]
    pub fn with_system_path(mut self, path: impl Into<String>) -> Self {
        self.system_paths.push(path.into());
        self
    }

    /// Set the per-command timeout
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Add a terminator
    #[must_use]
    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminators.push(terminator.into());
        self
    }
}

/// Regex rule copying a captured value into the response data
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extract {
    /// Key written in [`RunResponse::data`]
    pub key: String,
    /// Regular expression; group 1 is captured when present
    #[serde(rename = "regExpr", alias = "pattern")]
    pub pattern: String,
    /// Clear any previous value before matching
    #[serde(default)]
    pub reset: bool,
    /// Fail when nothing matches and the key holds no value
    #[serde(default)]
    pub required: bool,
}

impl Extract {
    /// Create an optional, non-resetting rule
    pub fn new(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            pattern: pattern.into(),
            reset: false,
            required: false,
        }
    }

    /// Mark the rule as required
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Mark the rule as resetting its key
    #[must_use]
    pub fn reset(mut self) -> Self {
        self.reset = true;
        self
    }
}

/// One command step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Execution {
    /// Command template, expanded before send
    pub command: String,
    /// Placeholder → credential reference; `#`-prefixed placeholders take the username
    pub credentials: BTreeMap<String, String>,
    /// Run only when the previous output contains this fragment
    pub match_output: Option<String>,
    /// Extraction rules applied to this step's output
    pub extraction: Vec<Extract>,
    /// Fragments that abort the sequence
    pub errors: Vec<String>,
    /// Fragments of which one must appear
    pub success: Vec<String>,
}

impl Execution {
    /// Create an unconditional step
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Make the step conditional on `fragment` appearing in the previous output
    #[must_use]
    pub fn when_output(mut self, fragment: impl Into<String>) -> Self {
        self.match_output = Some(fragment.into());
        self
    }

    /// Map a placeholder to a credential reference
    #[must_use]
    pub fn with_credential(mut self, placeholder: impl Into<String>, reference: impl Into<String>) -> Self {
        self.credentials.insert(placeholder.into(), reference.into());
        self
    }

    /// Add an abort-on-match fragment
    #[must_use]
    pub fn with_error(mut self, fragment: impl Into<String>) -> Self {
        self.errors.push(fragment.into());
        self
    }

    /// Add a required-match fragment
    #[must_use]
    pub fn with_success(mut self, fragment: impl Into<String>) -> Self {
        self.success.push(fragment.into());
        self
    }

    /// Add an extraction rule
    #[must_use]
    pub fn with_extract(mut self, rule: Extract) -> Self {
        self.extraction.push(rule);
        self
    }

    /// Whether the step only runs when triggered
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        self.match_output.as_deref().is_some_and(|m| !m.is_empty())
    }
}

/// Options plus the ordered executions they apply to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractableCommand {
    /// Shared settings
    pub options: ExecutionOptions,
    /// Steps in order
    pub executions: Vec<Execution>,
}

impl ExtractableCommand {
    /// Create a sequence from steps with default options
    #[must_use]
    pub fn new(executions: Vec<Execution>) -> Self {
        Self {
            options: ExecutionOptions::default(),
            executions,
        }
    }

    /// Replace the options
    #[must_use]
    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }
}

/// One sent command and what came back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLog {
    /// Command as sent, before credential substitution
    pub stdin: String,
    /// Raw output
    pub stdout: String,
    /// Error raised by this command, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of `run`/`extract`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResponse {
    /// Session the commands ran in
    pub session_id: String,
    /// Every command sent, in order
    pub cmd: Vec<CommandLog>,
    /// All stdout joined by newlines
    pub output: String,
    /// Extracted values
    pub data: BTreeMap<String, String>,
}

impl RunResponse {
    /// Create an empty response for a session
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    /// Append a log entry and accumulate its output
    pub fn add(&mut self, log: CommandLog) {
        if !self.output.is_empty() {
            self.output.push('\n');
        }
        self.output.push_str(&log.stdout);
        self.cmd.push(log);
    }

    /// Output of the `index`-th logged command
    #[must_use]
    pub fn stdout(&self, index: usize) -> Option<&str> {
        self.cmd.get(index).map(|c| c.stdout.as_str())
    }

    /// Number of log entries whose stdin equals `command`
    #[must_use]
    pub fn count(&self, command: &str) -> usize {
        self.cmd.iter().filter(|c| c.stdin == command).count()
    }
}

/// Open (or reconcile) the session for a target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenSessionRequest {
    /// Host to open
    pub target: Option<Target>,
    /// Variables to export
    pub env: BTreeMap<String, String>,
    /// Directories pushed to the front of `PATH`
    pub system_paths: Vec<String>,
    /// Caller owns closing; teardown leaves the session open
    pub transient: bool,
    /// Record the session into `<basedir>/replay.json`
    pub basedir: Option<PathBuf>,
}

impl OpenSessionRequest {
    /// Create a request for a target
    #[must_use]
    pub fn new(target: Target) -> Self {
        Self {
            target: Some(target),
            ..Default::default()
        }
    }

    /// Mark the session as caller-owned
    #[must_use]
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Add an exported variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Record the session into `basedir`
    #[must_use]
    pub fn with_basedir(mut self, basedir: impl Into<PathBuf>) -> Self {
        self.basedir = Some(basedir.into());
        self
    }
}

/// Identifier of an opened session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    /// Registry key
    pub session_id: String,
}

/// Plain commands to run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    /// Host to run on
    pub target: Option<Target>,
    /// Commands; `$stdout:/fragment/ ? command` runs only when triggered
    pub commands: Vec<String>,
    /// Run elevated with `sudo`
    pub superuser: bool,
    /// Per-command timeout; `0` uses the engine default
    pub timeout_ms: u64,
}

const INLINE_CONDITION_PREFIX: &str = "$stdout:/";

impl RunRequest {
    /// Create a request for a target
    #[must_use]
    pub fn new(target: Target, commands: Vec<String>) -> Self {
        Self {
            target: Some(target),
            commands,
            ..Default::default()
        }
    }

    /// Run elevated
    #[must_use]
    pub fn superuser(mut self) -> Self {
        self.superuser = true;
        self
    }

    /// Convert into an extractable sequence with the default error fragments
    #[must_use]
    pub fn as_extractable(&self) -> ExtractableCommand {
        let options = ExecutionOptions {
            timeout_ms: self.timeout_ms,
            ..Default::default()
        };
        let executions = self
            .commands
            .iter()
            .map(|command| {
                let (trigger, command) = parse_inline_condition(command);
                let mut execution = Execution::new(command);
                execution.match_output = trigger;
                execution.errors = vec![
                    COMMAND_NOT_FOUND.to_string(),
                    NO_SUCH_FILE_OR_DIRECTORY.to_string(),
                    ERROR_IS_NOT_RECOVERABLE.to_string(),
                ];
                execution
            })
            .collect();
        ExtractableCommand {
            options,
            executions,
        }
    }
}

/// Split `$stdout:/fragment/ ? command` into its trigger and command
fn parse_inline_condition(command: &str) -> (Option<String>, String) {
    let trimmed = command.trim_start();
    let Some(rest) = trimmed.strip_prefix(INLINE_CONDITION_PREFIX) else {
        return (None, command.to_string());
    };
    let Some((fragment, tail)) = rest.split_once('/') else {
        return (None, command.to_string());
    };
    match tail.trim_start().strip_prefix('?') {
        Some(body) if !fragment.is_empty() => {
            (Some(fragment.to_string()), body.trim().to_string())
        }
        _ => (None, command.to_string()),
    }
}

/// Sequence with extraction rules to run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractRequest {
    /// Host to run on
    pub target: Option<Target>,
    /// Run elevated with `sudo`
    pub superuser: bool,
    /// Options and steps
    pub sequence: ExtractableCommand,
}

impl ExtractRequest {
    /// Create a request for a target
    #[must_use]
    pub fn new(target: Target, sequence: ExtractableCommand) -> Self {
        Self {
            target: Some(target),
            superuser: false,
            sequence,
        }
    }

    /// Run elevated
    #[must_use]
    pub fn superuser(mut self) -> Self {
        self.superuser = true;
        self
    }
}

/// Close a session by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    /// Registry key returned by `open`
    pub session_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_address_defaults() {
        let address = Target::new("ssh:///opt/app").address().unwrap();
        assert_eq!(address.scheme, Scheme::Ssh);
        assert_eq!(address.host, "127.0.0.1");
        assert_eq!(address.port, 22);
        assert_eq!(address.directory.as_deref(), Some("/opt/app"));
        assert_eq!(address.session_id(), "127.0.0.1:22");
    }

    #[test]
    fn test_target_address_explicit_parts() {
        let address = Target::new("scp://deploy@10.0.0.7:2222/")
            .address()
            .unwrap();
        assert_eq!(address.scheme, Scheme::Ssh);
        assert_eq!(address.host, "10.0.0.7");
        assert_eq!(address.port, 2222);
        assert_eq!(address.directory, None);
        assert_eq!(address.username.as_deref(), Some("deploy"));
    }

    #[test]
    fn test_target_rejects_unknown_scheme() {
        let err = Target::new("http://example.com").address().unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedTarget(_)));
    }

    #[test]
    fn test_run_request_adds_default_errors() {
        let request = RunRequest::new(Target::new("ssh://h"), vec!["ls".into()]);
        let sequence = request.as_extractable();
        assert_eq!(sequence.executions[0].errors.len(), 3);
        assert!(!sequence.executions[0].is_conditional());
    }

    #[test]
    fn test_inline_condition_parsing() {
        assert_eq!(
            parse_inline_condition("$stdout:/Overwrite/ ? y"),
            (Some("Overwrite".to_string()), "y".to_string())
        );
        assert_eq!(
            parse_inline_condition("echo '$stdout:/x/'"),
            (None, "echo '$stdout:/x/'".to_string())
        );
        assert_eq!(
            parse_inline_condition("$stdout:/x/ no question"),
            (None, "$stdout:/x/ no question".to_string())
        );
    }

    #[test]
    fn test_response_accumulates_output() {
        let mut response = RunResponse::new("h:22");
        response.add(CommandLog {
            stdin: "a".into(),
            stdout: "1".into(),
            error: None,
        });
        response.add(CommandLog {
            stdin: "b".into(),
            stdout: "2".into(),
            error: None,
        });
        assert_eq!(response.output, "1\n2");
        assert_eq!(response.stdout(1), Some("2"));
    }
}

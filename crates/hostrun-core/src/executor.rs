//! Running command sequences against a terminal session
//!
//! A sequence is split into a [`Plan`]: primary steps that run in order, and
//! conditional steps that run only when the output of the step before them
//! contains their trigger. Each step walks the [`StepState`] machine:
//! expansion and credential substitution, send, terminator wait, validation
//! against `errors`/`success`, extraction, and finally the lookup of a
//! conditional successor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::classify::{CommandKind, classify};
use crate::credential::{CredentialResolver, substitute};
use crate::error::CoreError;
use crate::expand::VariableExpander;
use crate::extract::extract;
use crate::model::{CommandLog, Execution, ExecutionOptions, ExtractableCommand, RunResponse};
use crate::session::TerminalSession;

/// Progress of a single execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// Not started
    Pending,
    /// Command written to the shell
    Sent,
    /// Reading until a terminator
    AwaitingTerminator,
    /// A terminator was read
    Matched,
    /// Error and success fragments checked, extraction applied
    Validated,
    /// Output triggered a conditional successor
    ChainTriggered,
    /// Finished without a successor
    Done,
    /// Aborted
    Failed,
}

/// Primary steps plus the conditional steps they may trigger
#[derive(Debug)]
pub struct Plan<'a> {
    primary: Vec<&'a Execution>,
    conditional: Vec<(usize, &'a Execution)>,
}

impl<'a> Plan<'a> {
    /// Split a sequence into primary and conditional steps
    #[must_use]
    pub fn new(sequence: &'a ExtractableCommand) -> Self {
        let mut primary = Vec::new();
        let mut conditional = Vec::new();
        for (index, execution) in sequence.executions.iter().enumerate() {
            if execution.is_conditional() {
                conditional.push((index, execution));
            } else {
                primary.push(execution);
            }
        }
        Self {
            primary,
            conditional,
        }
    }

    /// Steps run unconditionally, in order
    #[must_use]
    pub fn primary(&self) -> &[&'a Execution] {
        &self.primary
    }

    /// First conditional step triggered by `stdout` that has not fired yet
    #[must_use]
    pub fn successor(&self, stdout: &str, fired: &HashSet<usize>) -> Option<(usize, &'a Execution)> {
        if stdout.is_empty() {
            return None;
        }
        self.conditional
            .iter()
            .find(|(index, execution)| {
                !fired.contains(index)
                    && execution
                        .match_output
                        .as_deref()
                        .is_some_and(|trigger| stdout.contains(trigger))
            })
            .copied()
    }
}

/// Drives sequences through a session
#[derive(Clone)]
pub struct Executor {
    resolver: Arc<CredentialResolver>,
    expander: Arc<dyn VariableExpander>,
    default_timeout: Duration,
    default_terminators: Vec<String>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("default_timeout", &self.default_timeout)
            .field("default_terminators", &self.default_terminators)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Create an executor
    pub fn new(resolver: Arc<CredentialResolver>, expander: Arc<dyn VariableExpander>) -> Self {
        Self {
            resolver,
            expander,
            default_timeout: Duration::from_secs(20),
            default_terminators: Vec::new(),
        }
    }

    /// Timeout used when options leave it at zero
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Terminators added to every read
    #[must_use]
    pub fn with_default_terminators(mut self, terminators: Vec<String>) -> Self {
        self.default_terminators = terminators;
        self
    }

    /// Apply options, then run every primary step and its triggered chain
    ///
    /// Log entries and extracted values accumulate in `response` even when an
    /// error aborts the sequence.
    ///
    /// # Errors
    /// Returns the first error; remaining steps are skipped
    pub async fn run_sequence(
        &self,
        session: &mut TerminalSession,
        sequence: &ExtractableCommand,
        response: &mut RunResponse,
    ) -> Result<(), CoreError> {
        let options = &sequence.options;
        self.apply_options(session, options).await?;

        let plan = Plan::new(sequence);
        for execution in plan.primary() {
            let command = self.expander.expand(&execution.command);
            match classify(&command) {
                CommandKind::ChangeDirectory(directory) => {
                    session.change_directory(&directory).await?;
                    continue;
                }
                CommandKind::SetEnv { key, value } => {
                    session.set_env(&key, &value).await?;
                    continue;
                }
                CommandKind::Compound(reset) => session.reset(reset),
                CommandKind::Plain => {}
            }
            self.run_chain(session, &plan, execution, command, options, response)
                .await?;
        }
        Ok(())
    }

    /// Export `PATH` and env, then change directory
    async fn apply_options(
        &self,
        session: &mut TerminalSession,
        options: &ExecutionOptions,
    ) -> Result<(), CoreError> {
        let system_paths: Vec<String> = options
            .system_paths
            .iter()
            .map(|p| self.expander.expand(p))
            .collect();
        let os = session.operating_system().await?;
        os.path.push(&system_paths);
        let path = os.path.env_value();
        if !path.is_empty() {
            session.set_env("PATH", &path).await?;
        }

        for (key, value) in &options.env {
            session.set_env(key, &self.expander.expand(value)).await?;
        }
        if let Some(directory) = &options.directory {
            session
                .change_directory(&self.expander.expand(directory))
                .await?;
        }
        Ok(())
    }

    /// Run `first`, already expanded to `command`, then whatever conditional
    /// steps its output triggers
    async fn run_chain(
        &self,
        session: &mut TerminalSession,
        plan: &Plan<'_>,
        first: &Execution,
        command: String,
        options: &ExecutionOptions,
        response: &mut RunResponse,
    ) -> Result<(), CoreError> {
        let mut fired = HashSet::new();
        let mut current = Some((first, command));

        while let Some((execution, command)) = current {
            let stdout = self
                .execute(session, execution, command, options, response)
                .await?;
            current = match plan.successor(&stdout, &fired) {
                Some((index, next)) => {
                    enter(StepState::ChainTriggered);
                    fired.insert(index);
                    Some((next, self.expander.expand(&next.command)))
                }
                None => {
                    enter(StepState::Done);
                    None
                }
            };
        }
        Ok(())
    }

    /// Terminators for one step: options, configured defaults, prompts, error fragments
    fn terminators(
        &self,
        session: &TerminalSession,
        options: &ExecutionOptions,
        execution: &Execution,
    ) -> Vec<String> {
        let mut terminators: Vec<String> = Vec::new();
        let candidates = options
            .terminators
            .iter()
            .chain(&self.default_terminators)
            .cloned()
            .chain(session.prompt_terminators())
            .chain(execution.errors.iter().cloned());
        for terminator in candidates {
            if !terminator.is_empty() && !terminators.contains(&terminator) {
                terminators.push(terminator);
            }
        }
        terminators
    }

    /// Run one step and validate it, returning its output
    async fn execute(
        &self,
        session: &mut TerminalSession,
        execution: &Execution,
        command: String,
        options: &ExecutionOptions,
        response: &mut RunResponse,
    ) -> Result<String, CoreError> {
        enter(StepState::Pending);
        let terminators = self.terminators(session, options, execution);
        let timeout = match options.timeout_ms {
            0 => self.default_timeout,
            ms => Duration::from_millis(ms),
        };

        let secured = if execution.credentials.is_empty() {
            None
        } else {
            let secrets = self
                .resolver
                .secrets(&execution.credentials)
                .await
                .map_err(|e| {
                    CoreError::Credential(format!("failed to run command: {command}, {e}"))
                })?;
            Some(substitute(&command, &secrets))
        };
        let to_send = secured.as_ref().map_or(command.as_str(), |s| s.as_str());

        enter(StepState::Sent);
        enter(StepState::AwaitingTerminator);
        let result = session
            .run(to_send, &command, timeout, &terminators)
            .await;

        let stdout = match result {
            Ok(stdout) => stdout,
            Err(e) => {
                enter(StepState::Failed);
                warn!(command = %command, error = %e, "command failed");
                response.add(CommandLog {
                    stdin: command,
                    stdout: e.stdout().to_string(),
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
        };
        enter(StepState::Matched);
        response.add(CommandLog {
            stdin: command.clone(),
            stdout: stdout.clone(),
            error: None,
        });

        if let Err(e) = validate(execution, &command, &stdout)
            .and_then(|()| extract(&execution.extraction, &stdout, &mut response.data))
        {
            enter(StepState::Failed);
            if let Some(last) = response.cmd.last_mut() {
                last.error = Some(e.to_string());
            }
            return Err(e);
        }
        enter(StepState::Validated);
        Ok(stdout)
    }
}

fn enter(state: StepState) {
    trace!(state = ?state, "step state");
}

/// Check abort-on-match fragments first, then required fragments
fn validate(execution: &Execution, command: &str, stdout: &str) -> Result<(), CoreError> {
    if let Some(fragment) = execution
        .errors
        .iter()
        .find(|f| !f.is_empty() && stdout.contains(f.as_str()))
    {
        debug!(fragment = %fragment, command = %command, "error fragment matched");
        return Err(CoreError::Pattern {
            fragment: fragment.clone(),
            command: command.to_string(),
            stdout: stdout.to_string(),
        });
    }
    let required: Vec<&String> = execution.success.iter().filter(|f| !f.is_empty()).collect();
    if !required.is_empty() && !required.iter().any(|f| stdout.contains(f.as_str())) {
        return Err(CoreError::MissingSuccess {
            fragments: execution.success.clone(),
            command: command.to_string(),
            stdout: stdout.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use hostrun_exec::{ReplayScript, ReplayTransport};

    use super::*;
    use crate::credential::FileCredentialStore;
    use crate::expand::NoopExpander;

    fn executor() -> Executor {
        let resolver = CredentialResolver::new(Arc::new(FileCredentialStore::default()));
        Executor::new(Arc::new(resolver), Arc::new(NoopExpander))
    }

    fn session(prompt: &str) -> TerminalSession {
        let script = ReplayScript {
            shell_prompt: prompt.to_string(),
            ..ReplayScript::new()
        };
        TerminalSession::new(
            "h:22",
            Box::new(ReplayTransport::new(script)),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_terminators_merge_sources_in_order() {
        let executor = executor()
            .with_default_terminators(vec!["> ".to_string(), "mysql>".to_string()]);
        let options = ExecutionOptions {
            terminators: vec!["Password".to_string(), String::new(), "> ".to_string()],
            ..Default::default()
        };
        let execution = Execution::new("mysql")
            .with_error("ERROR 1045")
            .with_error("$ ")
            .with_error("");

        let terminators = executor.terminators(&session("$ "), &options, &execution);
        assert_eq!(
            terminators,
            vec!["Password", "> ", "mysql>", "$ ", "# ", "ERROR 1045"]
        );
    }

    #[test]
    fn test_terminators_include_elevated_prompt_of_session() {
        let terminators = executor().terminators(
            &session("bash-5.1$ "),
            &ExecutionOptions::default(),
            &Execution::new("ls"),
        );
        assert_eq!(terminators, vec!["$ ", "sh-5.1# "]);
    }

    #[test]
    fn test_errors_take_precedence_over_success() {
        let execution = Execution::new("deploy")
            .with_error("FAILED")
            .with_success("DONE");
        let err = validate(&execution, "deploy", "DONE but FAILED").unwrap_err();
        assert!(matches!(err, CoreError::Pattern { ref fragment, .. } if fragment == "FAILED"));
    }

    #[test]
    fn test_empty_fragments_are_ignored() {
        let execution = Execution::new("ls").with_error("").with_success("");
        assert!(validate(&execution, "ls", "a b").is_ok());
    }

    struct CountingExpander(std::sync::Mutex<Vec<String>>);

    impl VariableExpander for CountingExpander {
        fn expand(&self, text: &str) -> String {
            if let Ok(mut seen) = self.0.lock() {
                seen.push(text.to_string());
            }
            text.to_string()
        }
    }

    #[tokio::test]
    async fn test_each_command_is_expanded_once() {
        let expander = Arc::new(CountingExpander(std::sync::Mutex::new(Vec::new())));
        let resolver = CredentialResolver::new(Arc::new(FileCredentialStore::default()));
        let executor = Executor::new(Arc::new(resolver), expander.clone());
        let mut session = TerminalSession::new(
            "h:22",
            Box::new(ReplayTransport::new(
                ReplayScript::new()
                    .respond("rm -i a", "remove a?")
                    .respond("y", ""),
            )),
            Duration::from_secs(1),
        );
        let sequence = ExtractableCommand::new(vec![
            Execution::new("rm -i a"),
            Execution::new("y").when_output("remove"),
        ]);
        let mut response = RunResponse::new("h:22");

        executor
            .run_sequence(&mut session, &sequence, &mut response)
            .await
            .unwrap();

        let seen = expander.0.lock().unwrap().clone();
        assert_eq!(seen.iter().filter(|t| *t == "rm -i a").count(), 1);
        assert_eq!(seen.iter().filter(|t| *t == "y").count(), 1);
        assert_eq!(response.cmd.len(), 2);
    }

    #[test]
    fn test_missing_success() {
        let execution = Execution::new("deploy").with_success("DONE");
        let err = validate(&execution, "deploy", "still going").unwrap_err();
        assert!(matches!(err, CoreError::MissingSuccess { .. }));
        assert!(validate(&execution, "deploy", "DONE").is_ok());
    }

    #[test]
    fn test_plan_splits_and_fires_once() {
        let sequence = ExtractableCommand::new(vec![
            Execution::new("rm -i file"),
            Execution::new("y").when_output("remove"),
            Execution::new("ls"),
        ]);
        let plan = Plan::new(&sequence);
        assert_eq!(plan.primary().len(), 2);

        let mut fired = HashSet::new();
        let (index, next) = plan.successor("remove file?", &fired).unwrap();
        assert_eq!(next.command, "y");
        fired.insert(index);
        assert!(plan.successor("remove file?", &fired).is_none());
        assert!(plan.successor("", &HashSet::new()).is_none());
    }
}

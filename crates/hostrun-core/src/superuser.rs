//! Rewriting a command sequence to run under `sudo`

use crate::error::CoreError;
use crate::model::{COMMAND_NOT_FOUND, Execution, ExecutionOptions, ExtractableCommand, Target};

/// Placeholder replaced by the target's password in the elevation step
pub const SUDO_CREDENTIAL_KEY: &str = "**sudo**";

/// Fragment of the `sudo` password prompt
pub const PASSWORD_PROMPT: &str = "Password";

const SUDO_PREFIX: &str = "sudo ";

/// Whether `command` already starts with the `sudo` prefix
fn is_elevated(command: &str) -> bool {
    command.trim_start().starts_with(SUDO_PREFIX)
}

fn push_unique(into: &mut Vec<String>, items: &[String]) {
    for item in items {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}

/// Produce a sequence equivalent to `sequence` that runs elevated
///
/// Every command gains a `sudo ` prefix, reads also stop at the password
/// prompt, and a trailing step triggered by that prompt answers it with the
/// target's credential.
///
/// # Errors
/// Returns `CoreError::Credential` when the target has no credential reference
pub fn elevate(target: &Target, sequence: &ExtractableCommand) -> Result<ExtractableCommand, CoreError> {
    let reference = target
        .credentials
        .as_deref()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| {
            CoreError::Credential(format!(
                "cannot run as superuser, credentials are empty for target: {}",
                target.url
            ))
        })?;

    let mut terminators = vec![PASSWORD_PROMPT.to_string()];
    push_unique(&mut terminators, &sequence.options.terminators);
    push_unique(&mut terminators, &[COMMAND_NOT_FOUND.to_string()]);
    let options = ExecutionOptions {
        terminators,
        ..sequence.options.clone()
    };

    let mut executions = Vec::with_capacity(sequence.executions.len() + 1);
    let mut password_step = Execution::new(SUDO_CREDENTIAL_KEY).when_output(PASSWORD_PROMPT);
    password_step.errors = vec![PASSWORD_PROMPT.to_string(), COMMAND_NOT_FOUND.to_string()];

    for execution in &sequence.executions {
        if execution.command.is_empty() {
            continue;
        }
        password_step.credentials.extend(
            execution
                .credentials
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        push_unique(&mut password_step.errors, &execution.errors);
        for rule in &execution.extraction {
            if !password_step.extraction.contains(rule) {
                password_step.extraction.push(rule.clone());
            }
        }

        let mut elevated = execution.clone();
        if execution.command.len() > 1 && !is_elevated(&execution.command) {
            elevated.command = format!("{SUDO_PREFIX}{}", execution.command);
        }
        executions.push(elevated);
    }

    password_step
        .credentials
        .insert(SUDO_CREDENTIAL_KEY.to_string(), reference.to_string());
    executions.push(password_step);

    Ok(ExtractableCommand {
        options,
        executions,
    })
}

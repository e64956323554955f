//! Classification of commands that mutate tracked shell state

/// Separators that chain several shell commands on one line
const COMPOUND_SEPARATORS: [&str; 3] = ["&&", "||", ";"];

/// Tracked state invalidated by a command sent verbatim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reset {
    /// Forget the cached working directory
    Directory,
    /// Forget the exported variable mirror
    Env,
}

/// How an expanded command is dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    /// Sent as-is
    Plain,
    /// A lone `cd`, routed through the de-duplicating directory change
    ChangeDirectory(String),
    /// A lone `export K=V`, routed through the de-duplicating export
    SetEnv {
        /// Variable name
        key: String,
        /// Unquoted value
        value: String,
    },
    /// Sent as-is, but invalidates tracked state
    Compound(Reset),
}

/// Classify an expanded command
#[must_use]
pub fn classify(command: &str) -> CommandKind {
    let command = command.trim();
    let compound = COMPOUND_SEPARATORS.iter().any(|s| command.contains(s));

    if let Some(directory) = command.strip_prefix("cd ") {
        if compound {
            return CommandKind::Compound(Reset::Directory);
        }
        return CommandKind::ChangeDirectory(directory.trim().to_string());
    }

    if let Some(assignment) = command.strip_prefix("export ") {
        if compound {
            return CommandKind::Compound(Reset::Env);
        }
        return match assignment.split_once('=') {
            Some((key, value))
                if !key.trim().is_empty()
                    && !key.trim().contains(char::is_whitespace)
                    && !value.contains('=') =>
            {
                CommandKind::SetEnv {
                    key: key.trim().to_string(),
                    value: value.trim().trim_matches(|c| c == '\'' || c == '"').to_string(),
                }
            }
            _ => CommandKind::Compound(Reset::Env),
        };
    }

    CommandKind::Plain
}

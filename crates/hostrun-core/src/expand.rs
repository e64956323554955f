//! Variable expansion of command templates

use std::collections::BTreeMap;

/// Expands `$name` / `${name}` references in command templates
pub trait VariableExpander: Send + Sync {
    /// Expand `text`; unknown references are left untouched
    fn expand(&self, text: &str) -> String;
}

/// Leaves text unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExpander;

impl VariableExpander for NoopExpander {
    fn expand(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Expands from a fixed map of values
#[derive(Debug, Clone, Default)]
pub struct MapExpander {
    values: BTreeMap<String, String>,
}

impl MapExpander {
    /// Create an expander over `values`
    #[must_use]
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    /// Add a value
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

impl VariableExpander for MapExpander {
    fn expand(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];

            let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
                match braced.find('}') {
                    Some(end) => (&braced[..end], end + 2),
                    None => ("", 0),
                }
            } else {
                let end = after.find(|c| !is_name_char(c)).unwrap_or(after.len());
                // a trailing dot belongs to the sentence, not the name
                let name = after[..end].trim_end_matches('.');
                (name, name.len())
            };

            match self.values.get(name) {
                Some(value) if !name.is_empty() => {
                    out.push_str(value);
                    rest = &after[consumed..];
                }
                _ => {
                    out.push('$');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

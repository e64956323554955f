//! Regex extraction of values from command output

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::trace;

use crate::error::CoreError;
use crate::model::Extract;

/// CSI sequences (colors, cursor movement) and OSC sequences (window titles)
static ANSI_ESCAPE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07]*\x07").ok());

/// Remove terminal escape sequences from a line
#[must_use]
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    match ANSI_ESCAPE.as_ref() {
        Some(re) => re.replace_all(line, ""),
        None => Cow::Borrowed(line),
    }
}

/// Compiled set of extraction rules
#[derive(Debug, Clone)]
pub struct Extractor {
    rules: Vec<(Extract, Regex)>,
}

impl Extractor {
    /// Compile rules in order
    ///
    /// # Errors
    /// Returns `CoreError::Extraction` naming the first invalid pattern
    pub fn compile(rules: &[Extract]) -> Result<Self, CoreError> {
        let rules = rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|re| (rule.clone(), re))
                    .map_err(|e| CoreError::Extraction {
                        key: rule.key.clone(),
                        pattern: rule.pattern.clone(),
                        reason: format!("invalid pattern: {e}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Whether there are no rules
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply every rule to `text`, writing captures into `data`
    ///
    /// # Errors
    /// Returns `CoreError::Extraction` when a required rule matched nothing
    /// and its key holds no value
    pub fn apply(&self, text: &str, data: &mut BTreeMap<String, String>) -> Result<(), CoreError> {
        for (rule, re) in &self.rules {
            if rule.reset {
                data.remove(&rule.key);
            }
            if data.contains_key(&rule.key) {
                continue;
            }

            match first_capture(re, text) {
                Some(value) => {
                    trace!(key = %rule.key, value = %value, "extracted");
                    data.insert(rule.key.clone(), value);
                }
                None if rule.required => {
                    return Err(CoreError::Extraction {
                        key: rule.key.clone(),
                        pattern: rule.pattern.clone(),
                        reason: "no match found".to_string(),
                    });
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// Capture of the first matching line, tried raw and then without escapes
fn first_capture(re: &Regex, text: &str) -> Option<String> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .find_map(|line| capture(re, line).or_else(|| capture(re, &strip_ansi(line))))
}

fn capture(re: &Regex, line: &str) -> Option<String> {
    let caps = re.captures(line)?;
    caps.get(1)
        .or_else(|| caps.get(0))
        .map(|m| m.as_str().to_string())
}

/// Compile and apply `rules` in one step
///
/// # Errors
/// See [`Extractor::compile`] and [`Extractor::apply`]
pub fn extract(
    rules: &[Extract],
    text: &str,
    data: &mut BTreeMap<String, String>,
) -> Result<(), CoreError> {
    if rules.is_empty() {
        return Ok(());
    }
    Extractor::compile(rules)?.apply(text, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_group_one() {
        let mut data = BTreeMap::new();
        extract(
            &[Extract::new("version", r"go version go([^\s]+)")],
            "go version go1.8 darwin/amd64",
            &mut data,
        )
        .unwrap();
        assert_eq!(data["version"], "1.8");
    }

    #[test]
    fn test_whole_match_without_group() {
        let mut data = BTreeMap::new();
        extract(&[Extract::new("ip", r"\d+\.\d+\.\d+\.\d+")], "inet 10.0.0.4/24", &mut data)
            .unwrap();
        assert_eq!(data["ip"], "10.0.0.4");
    }

    #[test]
    fn test_matches_after_stripping_escapes() {
        let mut data = BTreeMap::new();
        extract(
            &[Extract::new("status", r"^status: (\w+)$")],
            "\x1b[32mstatus: \x1b[0mrunning\r\n",
            &mut data,
        )
        .unwrap();
        assert_eq!(data["status"], "running");
    }

    #[test]
    fn test_first_registered_wins_without_reset() {
        let mut data = BTreeMap::from([("pid".to_string(), "100".to_string())]);
        extract(&[Extract::new("pid", r"pid=(\d+)")], "pid=200", &mut data).unwrap();
        assert_eq!(data["pid"], "100");

        extract(&[Extract::new("pid", r"pid=(\d+)").reset()], "pid=200", &mut data).unwrap();
        assert_eq!(data["pid"], "200");
    }

    #[test]
    fn test_required_missing_names_key() {
        let mut data = BTreeMap::new();
        let err = extract(
            &[Extract::new("build", r"BUILD (\w+)").required()],
            "nothing here",
            &mut data,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Extraction { ref key, .. } if key == "build"));
    }

    #[test]
    fn test_required_satisfied_by_existing_value() {
        let mut data = BTreeMap::from([("build".to_string(), "SUCCESS".to_string())]);
        extract(
            &[Extract::new("build", r"BUILD (\w+)").required()],
            "nothing here",
            &mut data,
        )
        .unwrap();
        assert_eq!(data["build"], "SUCCESS");
    }

    #[test]
    fn test_invalid_pattern_is_extraction_error() {
        let err = Extractor::compile(&[Extract::new("k", "(unclosed")]).unwrap_err();
        assert!(matches!(err, CoreError::Extraction { ref pattern, .. } if pattern == "(unclosed"));
    }
}

//! A single stage's contribution to the environment.

use crate::config::EnvEntry;
use serde::{Deserialize, Serialize};

/// Returns true if `key` is a valid shell variable name.
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Ordered `KEY=VALUE` pairs contributed by one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvFragment {
    /// The contributing stage.
    pub source: String,
    /// Entries in definition order.
    pub entries: Vec<(String, String)>,
}

impl EnvFragment {
    /// Creates an empty fragment for `source`.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            entries: Vec::new(),
        }
    }

    /// Adds an entry.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    /// Adds an entry in place.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Builds a fragment from configured entries.
    #[must_use]
    pub fn from_entries(source: impl Into<String>, entries: &[EnvEntry]) -> Self {
        Self {
            source: source.into(),
            entries: entries
                .iter()
                .map(|e| (e.key.clone(), e.value.clone()))
                .collect(),
        }
    }

    /// Returns true if the fragment has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the keys that are not valid variable names.
    #[must_use]
    pub fn invalid_keys(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|(k, _)| k.as_str())
            .filter(|k| !is_valid_key(k))
            .collect()
    }

    /// Returns the keys whose values cannot be written as one `export`
    /// line: line breaks and NUL bytes.
    #[must_use]
    pub fn unrepresentable_values(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, v)| v.contains(['\n', '\r', '\0']))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Renders the fragment as a block of `export` lines under a header.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!("# stage: {}\n", self.source);
        for (key, value) in &self.entries {
            out.push_str("export ");
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&quote(value));
            out.push_str("\"\n");
        }
        out
    }
}

/// Escapes a value for a double-quoted shell string, leaving `$` live.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

//! Variable snapshots used for interpolation
//!
//! The loader never reads the process environment itself. Callers capture
//! a [`VariableSnapshot`] once at startup and pass it in.

use crate::error::{KeelError, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Default name of the adjacent variables file
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Immutable set of externally supplied variable values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableSnapshot {
    values: BTreeMap<String, String>,
}

impl VariableSnapshot {
    /// Create an empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the current process environment
    pub fn from_process() -> Self {
        Self {
            values: std::env::vars().collect(),
        }
    }

    /// Build a snapshot from key/value pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Layer values from an env file underneath this snapshot.
    ///
    /// Values already present (e.g. from the process environment) win.
    pub fn with_env_file(mut self, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KeelError::Parse(format!("Failed to read env file {}: {}", path.display(), e))
        })?;
        for (key, value) in parse_env_file(&content)? {
            self.values.entry(key).or_insert(value);
        }
        Ok(self)
    }

    /// Look up a variable
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|s| s.as_str())
    }

    /// Whether a variable is present (possibly empty)
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Return a copy with one variable overridden
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }

    /// Number of variables in the snapshot
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Parse `KEY=VALUE` lines.
///
/// Supports `#` comments, blank lines, an optional `export ` prefix and
/// single or double quoted values. Unquoted values lose trailing ` #` comments.
pub fn parse_env_file(content: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();

        let (key, value) = line.split_once('=').ok_or_else(|| {
            KeelError::Parse(format!(
                "env file line {}: expected KEY=VALUE, got '{}'",
                index + 1,
                raw
            ))
        })?;

        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(KeelError::Parse(format!(
                "env file line {}: invalid variable name '{}'",
                index + 1,
                key
            )));
        }

        pairs.push((key.to_string(), unquote(value.trim())));
    }

    Ok(pairs)
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == b'\'' && last == b'\'' {
            return value[1..value.len() - 1].to_string();
        }
        if first == b'"' && last == b'"' {
            return value[1..value.len() - 1]
                .replace("\\n", "\n")
                .replace("\\\"", "\"");
        }
    }
    match value.find(" #") {
        Some(pos) => value[..pos].trim_end().to_string(),
        None => value.to_string(),
    }
}

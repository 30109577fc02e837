//! Variable interpolation for compose documents
//!
//! Supported forms: `$VAR`, `${VAR}`, `${VAR:-default}`, `${VAR-default}`,
//! `${VAR:?message}`, `${VAR?message}`, `${VAR:+alternative}`,
//! `${VAR+alternative}` and `$$` for a literal dollar sign.

use super::environment::VariableSnapshot;
use crate::error::{KeelError, Result};
use regex::{Captures, Regex};
use serde_yaml::Value;
use std::sync::OnceLock;

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"\$(?:(?P<escape>\$)|\{(?P<braced>[A-Za-z_][A-Za-z0-9_]*)(?:(?P<op>:?[-?+])(?P<arg>[^}]*))?\}|\{(?P<invalid>[^}]*)\}?|(?P<named>[A-Za-z_][A-Za-z0-9_]*))",
        )
        .expect("interpolation pattern is valid")
    })
}

/// Interpolate a single string.
///
/// `location` names the document path of the value and is carried in errors.
pub fn interpolate_str(input: &str, vars: &VariableSnapshot, location: &str) -> Result<String> {
    if !input.contains('$') {
        return Ok(input.to_string());
    }

    let mut output = String::with_capacity(input.len());
    let mut last = 0;

    for caps in pattern().captures_iter(input) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        output.push_str(&input[last..whole.start]);
        output.push_str(&substitute(&caps, vars, location)?);
        last = whole.end;
    }
    output.push_str(&input[last..]);

    Ok(output)
}

fn substitute(caps: &Captures<'_>, vars: &VariableSnapshot, location: &str) -> Result<String> {
    if caps.name("escape").is_some() {
        return Ok("$".to_string());
    }

    if let Some(invalid) = caps.name("invalid") {
        return Err(KeelError::Parse(format!(
            "invalid interpolation format '${{{}}}' at {}",
            invalid.as_str(),
            location
        )));
    }

    let name = caps
        .name("braced")
        .or_else(|| caps.name("named"))
        .map(|m| m.as_str())
        .unwrap_or_default();
    let value = vars.get(name);

    let missing = |message: Option<String>| KeelError::MissingVariable {
        variable: name.to_string(),
        location: location.to_string(),
        message,
    };

    let Some(op) = caps.name("op").map(|m| m.as_str()) else {
        return value.map(str::to_string).ok_or_else(|| missing(None));
    };

    let arg = caps.name("arg").map(|m| m.as_str()).unwrap_or_default();
    // `:` variants treat an empty value like an unset one
    let present = if op.starts_with(':') {
        value.filter(|v| !v.is_empty())
    } else {
        value
    };

    match op.trim_start_matches(':') {
        "-" => match present {
            Some(v) => Ok(v.to_string()),
            None => interpolate_str(arg, vars, location),
        },
        "?" => match present {
            Some(v) => Ok(v.to_string()),
            None => Err(missing((!arg.is_empty()).then(|| arg.to_string()))),
        },
        "+" => match present {
            Some(_) => interpolate_str(arg, vars, location),
            None => Ok(String::new()),
        },
        other => Err(KeelError::Parse(format!(
            "unsupported interpolation operator '{}' at {}",
            other, location
        ))),
    }
}

/// Interpolate every string scalar in a document tree in place.
///
/// Mapping keys are left untouched.
pub fn interpolate_value(value: &mut Value, vars: &VariableSnapshot) -> Result<()> {
    let mut path = Vec::new();
    walk(value, vars, &mut path)
}

fn walk(value: &mut Value, vars: &VariableSnapshot, path: &mut Vec<String>) -> Result<()> {
    match value {
        Value::String(s) => {
            *s = interpolate_str(s, vars, &path.join("."))?;
        }
        Value::Sequence(items) => {
            for (index, item) in items.iter_mut().enumerate() {
                path.push(index.to_string());
                walk(item, vars, path)?;
                path.pop();
            }
        }
        Value::Mapping(map) => {
            for (key, item) in map.iter_mut() {
                path.push(key_label(key));
                walk(item, vars, path)?;
                path.pop();
            }
        }
        Value::Tagged(tagged) => walk(&mut tagged.value, vars, path)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

pub(crate) fn key_label(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => "?".to_string(),
    }
}

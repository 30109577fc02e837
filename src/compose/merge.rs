//! Fragment reuse and document overlays
//!
//! YAML anchors are expanded by the parser. Merge keys (`<<`) and
//! multi-file overlays are resolved here with [`merge_mappings`]: a shallow
//! union where the overlay wins, descending one level into nested mappings
//! such as `environment` or `labels`.

use super::interpolate::key_label;
use crate::error::{KeelError, Result};
use serde_yaml::{Mapping, Value};

/// Key used for YAML merges
pub const MERGE_KEY: &str = "<<";

/// Top-level sections merged entry by entry when overlaying documents
const NAMED_SECTIONS: &[&str] = &["services", "networks", "volumes"];

/// Merge `overlay` on top of `base`.
///
/// Keys from `overlay` win. When both sides hold a mapping under the same
/// key, the two inner mappings are unioned (again with `overlay` winning)
/// instead of being replaced wholesale. Deeper levels are replaced.
pub fn merge_mappings(base: &Mapping, overlay: &Mapping) -> Mapping {
    let mut result = base.clone();

    for (key, value) in overlay {
        match (result.get_mut(key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(incoming)) => {
                for (inner_key, inner_value) in incoming {
                    existing.insert(inner_key.clone(), inner_value.clone());
                }
            }
            _ => {
                result.insert(key.clone(), value.clone());
            }
        }
    }

    result
}

/// Expand every `<<` merge key in the tree, in place.
///
/// A merge key may reference one mapping or a list of mappings. Lists are
/// folded left to right so later fragments win, and the mapping's own keys
/// are applied last.
pub fn resolve_merge_keys(value: &mut Value) -> Result<()> {
    let mut path = Vec::new();
    resolve(value, &mut path)
}

fn resolve(value: &mut Value, path: &mut Vec<String>) -> Result<()> {
    match value {
        Value::Mapping(map) => {
            for (key, item) in map.iter_mut() {
                path.push(key_label(key));
                resolve(item, path)?;
                path.pop();
            }

            if let Some(fragments) = map.remove(MERGE_KEY) {
                let base = fold_fragments(fragments, path)?;
                let merged = merge_mappings(&base, map);
                *map = merged;
            }
        }
        Value::Sequence(items) => {
            for (index, item) in items.iter_mut().enumerate() {
                path.push(index.to_string());
                resolve(item, path)?;
                path.pop();
            }
        }
        Value::Tagged(tagged) => resolve(&mut tagged.value, path)?,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
    }
    Ok(())
}

fn fold_fragments(fragments: Value, path: &[String]) -> Result<Mapping> {
    let invalid = || {
        KeelError::Parse(format!(
            "merge key at '{}' must reference a mapping or a list of mappings",
            path.join(".")
        ))
    };

    match fragments {
        Value::Mapping(map) => Ok(map),
        Value::Sequence(items) => items.into_iter().try_fold(Mapping::new(), |acc, item| {
            match item {
                Value::Mapping(fragment) => Ok(merge_mappings(&acc, &fragment)),
                _ => Err(invalid()),
            }
        }),
        _ => Err(invalid()),
    }
}

/// Overlay one whole document on another (`-f base.yml -f override.yml`).
///
/// Entries under `services`, `networks` and `volumes` are merged by name
/// with [`merge_mappings`]; every other top-level key is replaced.
pub fn merge_documents(base: &Mapping, overlay: &Mapping) -> Mapping {
    let mut result = base.clone();

    for (key, value) in overlay {
        let named_section = key
            .as_str()
            .map(|k| NAMED_SECTIONS.contains(&k))
            .unwrap_or(false);

        match (result.get_mut(key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(incoming)) if named_section => {
                for (name, entry) in incoming {
                    let merged = match (existing.get(name), entry) {
                        (Some(Value::Mapping(current)), Value::Mapping(update)) => {
                            Value::Mapping(merge_mappings(current, update))
                        }
                        _ => entry.clone(),
                    };
                    existing.insert(name.clone(), merged);
                }
            }
            _ => {
                result.insert(key.clone(), value.clone());
            }
        }
    }

    result
}

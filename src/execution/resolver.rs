//! Parameter Resolution
//!
//! Resolves `${path}` references in step parameters against the execution
//! state. The first path segment selects the root:
//! - `input` routes into the execution's input data
//! - anything else names a step whose recorded output is used
//!
//! Remaining segments index into nested objects. A reference that cannot
//! be found yields [`Resolution::Missing`], which the engine turns into a
//! pause rather than a failure.

use log::debug;
use serde_json::{Map, Value};

use crate::workflow::ExecutionState;

/// Root segment that addresses the execution's input data.
pub const INPUT_ROOT: &str = "input";

/// Outcome of resolving references.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    Ready(T),
    /// The dotted path that could not be found
    Missing(String),
}

impl<T> Resolution<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolution<U> {
        match self {
            Self::Ready(value) => Resolution::Ready(f(value)),
            Self::Missing(path) => Resolution::Missing(path),
        }
    }
}

/// Looks up a dotted path in the execution state.
///
/// `input` alone yields the whole input object.
pub fn resolve_path(path: &str, state: &ExecutionState) -> Option<Value> {
    let mut segments = path.trim().split('.');
    let root = segments.next().filter(|s| !s.is_empty())?;

    let mut current: &Value = if root == INPUT_ROOT {
        match segments.next() {
            Some(first) => state.input_data.get(first)?,
            None => return Some(Value::Object(state.input_data.clone())),
        }
    } else {
        state.outputs.get(root)?
    };

    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current.clone())
}

/// Extracts the references in a string, in order of appearance.
pub fn extract_references(text: &str) -> Vec<&str> {
    let mut refs = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                refs.push(after[..end].trim());
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    refs
}

/// Renders a value for interpolation into a larger string.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn resolve_string(text: &str, state: &ExecutionState) -> Resolution<Value> {
    let refs = extract_references(text);
    if refs.len() != 1 {
        if refs.len() > 1 {
            debug!("Leaving '{}' unresolved: only single references are substituted", text);
        }
        return Resolution::Ready(Value::String(text.to_string()));
    }

    let path = refs[0];
    let Some(value) = resolve_path(path, state) else {
        return Resolution::Missing(path.to_string());
    };

    let trimmed = text.trim();
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        // The whole value is the reference; keep its type
        return Resolution::Ready(value);
    }

    let start = text.find("${").unwrap_or(0);
    let end = text[start..].find('}').map(|i| start + i + 1).unwrap_or(text.len());
    let mut out = String::with_capacity(text.len());
    out.push_str(&text[..start]);
    out.push_str(&value_to_text(&value));
    out.push_str(&text[end..]);
    Resolution::Ready(Value::String(out))
}

/// Resolves references inside a single value, recursing into containers.
pub fn resolve_value(value: &Value, state: &ExecutionState) -> Resolution<Value> {
    match value {
        Value::String(s) => resolve_string(s, state),
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                match resolve_value(item, state) {
                    Resolution::Ready(v) => resolved.push(v),
                    Resolution::Missing(path) => return Resolution::Missing(path),
                }
            }
            Resolution::Ready(Value::Array(resolved))
        }
        Value::Object(map) => resolve_parameters(map, state).map(Value::Object),
        other => Resolution::Ready(other.clone()),
    }
}

/// Resolves every declared parameter of a step.
///
/// Stops at the first reference that cannot be found.
pub fn resolve_parameters(
    parameters: &Map<String, Value>,
    state: &ExecutionState,
) -> Resolution<Map<String, Value>> {
    let mut resolved = Map::with_capacity(parameters.len());
    for (key, value) in parameters {
        match resolve_value(value, state) {
            Resolution::Ready(v) => {
                resolved.insert(key.clone(), v);
            }
            Resolution::Missing(path) => {
                debug!("Parameter '{}' references missing '{}'", key, path);
                return Resolution::Missing(path);
            }
        }
    }
    Resolution::Ready(resolved)
}

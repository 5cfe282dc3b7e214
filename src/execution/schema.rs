//! Schema Validation
//!
//! Checks step inputs and outputs against the JSON-Schema subset workflow
//! authors actually use: `type`, `required`, `properties`,
//! `additionalProperties: false`, `enum`, `items`, string length, numeric
//! bounds and array length. Unknown keywords are ignored.
//!
//! Every violation is reported, each prefixed with the path of the
//! offending value (`$` is the root).

use serde_json::{Map, Value};

use super::error::{SchemaKind, StepError};
use crate::workflow::Step;

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
            _ => false,
        },
        // Unknown type names never reject
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_type(schema: &Map<String, Value>, value: &Value, path: &str, errors: &mut Vec<String>) -> bool {
    let expected: Vec<&str> = match schema.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).collect(),
        _ => return true,
    };

    if expected.iter().any(|t| type_matches(t, value)) {
        return true;
    }
    errors.push(format!(
        "{}: expected {}, found {}",
        path,
        expected.join(" or "),
        type_name(value)
    ));
    false
}

fn check_object(schema: &Map<String, Value>, object: &Map<String, Value>, path: &str, errors: &mut Vec<String>) {
    if let Some(Value::Array(required)) = schema.get("required") {
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                errors.push(format!("{}: missing required property '{}'", path, key));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (key, sub_schema) in properties {
            if let Some(value) = object.get(key) {
                validate_at(sub_schema, value, &format!("{}.{}", path, key), errors);
            }
        }
    }

    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        for key in object.keys() {
            if !properties.is_some_and(|p| p.contains_key(key)) {
                errors.push(format!("{}: unexpected property '{}'", path, key));
            }
        }
    }
}

fn check_array(schema: &Map<String, Value>, items: &[Value], path: &str, errors: &mut Vec<String>) {
    if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
        if (items.len() as u64) < min {
            errors.push(format!("{}: expected at least {} items, found {}", path, min, items.len()));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
        if (items.len() as u64) > max {
            errors.push(format!("{}: expected at most {} items, found {}", path, max, items.len()));
        }
    }
    if let Some(item_schema) = schema.get("items") {
        for (i, item) in items.iter().enumerate() {
            validate_at(item_schema, item, &format!("{}[{}]", path, i), errors);
        }
    }
}

fn check_string(schema: &Map<String, Value>, text: &str, path: &str, errors: &mut Vec<String>) {
    let len = text.chars().count() as u64;
    if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
        if len < min {
            errors.push(format!("{}: shorter than {} characters", path, min));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
        if len > max {
            errors.push(format!("{}: longer than {} characters", path, max));
        }
    }
}

fn check_number(schema: &Map<String, Value>, n: f64, path: &str, errors: &mut Vec<String>) {
    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
        if n < min {
            errors.push(format!("{}: {} is less than minimum {}", path, n, min));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
        if n > max {
            errors.push(format!("{}: {} is greater than maximum {}", path, n, max));
        }
    }
}

fn validate_at(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        // `true`, `{}` and anything unrecognised accept everything
        return;
    };

    if !check_type(schema, value, path, errors) {
        return;
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            errors.push(format!("{}: {} is not one of the allowed values", path, value));
        }
    }

    match value {
        Value::Object(object) => check_object(schema, object, path, errors),
        Value::Array(items) => check_array(schema, items, path, errors),
        Value::String(text) => check_string(schema, text, path, errors),
        Value::Number(n) => {
            if let Some(n) = n.as_f64() {
                check_number(schema, n, path, errors);
            }
        }
        _ => {}
    }
}

/// Validates a value against a schema, returning every violation.
pub fn validate(schema: &Value, value: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    validate_at(schema, value, "$", &mut errors);
    errors
}

fn check(step: &Step, kind: SchemaKind, schema: Option<&Value>, value: &Value) -> Result<(), StepError> {
    let Some(schema) = schema else {
        return Ok(());
    };
    let messages = validate(schema, value);
    if messages.is_empty() {
        Ok(())
    } else {
        Err(StepError::SchemaValidation {
            step_id: step.id.clone(),
            kind,
            messages,
        })
    }
}

/// Checks resolved parameters against the step's input schema, if any.
pub fn validate_input(step: &Step, parameters: &Map<String, Value>) -> Result<(), StepError> {
    check(
        step,
        SchemaKind::Input,
        step.config.input_schema.as_ref(),
        &Value::Object(parameters.clone()),
    )
}

/// Checks a step result against the step's output schema, if any.
pub fn validate_output(step: &Step, output: &Value) -> Result<(), StepError> {
    check(step, SchemaKind::Output, step.config.output_schema.as_ref(), output)
}

/*!
 * JSON recovery from model output.
 *
 * Models often wrap the requested object in a Markdown fence or add a line of
 * prose around it. `extract_json` finds the object; `parse_object` turns it
 * into a JSON map or explains why it could not.
 */

use serde_json::{Map, Value};

use crate::errors::{Diagnostics, PipelineError};

/// Why a model response could not be used
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFault {
    /// Not a JSON object at all
    Unparseable(String),
    /// A JSON object, but missing keys or wrongly typed values
    Invalid(String),
}

impl ResponseFault {
    pub fn into_error(self, diagnostics: Diagnostics) -> PipelineError {
        match self {
            Self::Unparseable(message) => PipelineError::ResponseParsing { message, diagnostics },
            Self::Invalid(message) => PipelineError::Validation { message, diagnostics },
        }
    }
}

/// Locate the JSON object inside a model response
///
/// Tries, in order: the whole trimmed response, a ```json fence, a bare
/// ``` fence, and the span from the first `{` to the last `}`.
pub fn extract_json(response: &str) -> Option<&str> {
    let trimmed = response.trim();

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }

    if let Some(start) = trimmed.find("```json") {
        let body = &trimmed[start + 7..];
        if let Some(end) = body.find("```") {
            return Some(body[..end].trim());
        }
    }

    if let Some(start) = trimmed.find("```") {
        let body = &trimmed[start + 3..];
        if let Some(end) = body.find("```") {
            let inner = body[..end].trim();
            if inner.starts_with('{') {
                return Some(inner);
            }
        }
    }

    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => Some(&trimmed[start..=end]),
        _ => None,
    }
}

/// Parse a model response into a JSON object
///
/// The error string describes the failure for diagnostics.
pub fn parse_object(response: &str) -> Result<Map<String, Value>, String> {
    if response.trim().is_empty() {
        return Err("Response is empty".to_string());
    }
    let json = extract_json(response).ok_or_else(|| "No JSON object found in response".to_string())?;
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("Expected a JSON object, got {}", type_name(&other))),
        Err(e) => Err(format!("Invalid JSON: {}", e)),
    }
}

/// Read a required array of strings
///
/// Non-string items are an error rather than silently skipped.
pub fn string_list(map: &Map<String, Value>, key: &str) -> Result<Vec<String>, String> {
    match map.get(key) {
        None => Err(format!("Missing required key '{}'", key)),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(format!("'{}' must contain strings, found {}", key, type_name(other))),
            })
            .collect(),
        Some(other) => Err(format!("'{}' must be an array, found {}", key, type_name(other))),
    }
}

/// Read a required string
pub fn required_string(map: &Map<String, Value>, key: &str) -> Result<String, String> {
    match map.get(key) {
        None => Err(format!("Missing required key '{}'", key)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(format!("'{}' must be a string, found {}", key, type_name(other))),
    }
}

/// Read an optional string; `null` counts as absent
pub fn optional_string(map: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(format!("'{}' must be a string, found {}", key, type_name(other))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

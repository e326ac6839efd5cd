//! The result envelope printed on stdout.

use std::str::FromStr;

use serde_json::{json, Map, Value};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Text,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(Format::Json),
            "text" => Ok(Format::Text),
            other => Err(format!("unknown format '{}', expected json or text", other)),
        }
    }
}

pub fn success(result: Value) -> Value {
    json!({ "ok": true, "result": result })
}

pub fn failure(error: &Error) -> Value {
    failure_parts(error.type_name(), &error.to_string(), error.remediation())
}

pub fn failure_parts(type_name: &str, message: &str, remediation: Option<String>) -> Value {
    json!({
        "ok": false,
        "error": {
            "type": type_name,
            "message": message,
            "remediation": remediation,
        }
    })
}

/// Render an envelope. JSON output is pretty printed with sorted keys.
pub fn render(envelope: &Value, format: Format) -> String {
    match format {
        Format::Json => serde_json::to_string_pretty(envelope).unwrap_or_else(|_| envelope.to_string()),
        Format::Text => render_text(envelope),
    }
}

fn render_text(envelope: &Value) -> String {
    if envelope.get("ok").and_then(Value::as_bool) == Some(true) {
        return render_value(envelope.get("result").unwrap_or(&Value::Null));
    }

    let error = envelope.get("error").cloned().unwrap_or(Value::Null);
    let mut out = format!(
        "ERROR [{}]: {}",
        error.get("type").and_then(Value::as_str).unwrap_or("Error"),
        error.get("message").and_then(Value::as_str).unwrap_or_default()
    );
    if let Some(hint) = error.get("remediation").and_then(Value::as_str) {
        out.push_str("\nhint: ");
        out.push_str(hint);
    }
    out
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| format!("- {}", item))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => render_object(map),
        other => other.to_string(),
    }
}

fn render_object(map: &Map<String, Value>) -> String {
    let mut lines = Vec::new();
    for (key, value) in map {
        match value {
            Value::Object(_) | Value::Array(_) => {
                lines.push(format!("{}:", key));
                lines.push(serde_json::to_string_pretty(value).unwrap_or_default());
            }
            Value::String(s) => lines.push(format!("{}: {}", key, s)),
            other => lines.push(format!("{}: {}", key, other)),
        }
    }
    lines.join("\n")
}

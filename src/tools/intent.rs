//! Canonical tool-call intents.
//!
//! The LLM emits intents in two shapes: OpenAI-style
//! `{id, function: {name, arguments: "<json string>"}}` and the direct
//! `{id, name, args: {...}}`. Both parse to the same internal form.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallIntent {
    pub call_id: String,
    pub name: String,
    /// Always a JSON object; missing or unparseable arguments collapse to
    /// `{}`.
    pub arguments: Value,
}

impl ToolCallIntent {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments: ensure_object(arguments),
        }
    }

    /// Parse either intent shape into canonical form.
    pub fn parse(value: &Value) -> Self {
        let call_id = value.get("id").and_then(Value::as_str).unwrap_or("").to_string();

        // OpenAI shape: function.name + function.arguments (JSON string)
        if let Some(function) = value.get("function") {
            let name = function.get("name").and_then(Value::as_str).unwrap_or("").to_string();
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| json!({})),
                Some(v) => ensure_object(v.clone()),
                None => json!({}),
            };
            return Self {
                call_id,
                name,
                arguments,
            };
        }

        // Direct shape: name + args (already an object)
        let name = value.get("name").and_then(Value::as_str).unwrap_or("").to_string();
        let arguments = value
            .get("args")
            .or_else(|| value.get("arguments"))
            .cloned()
            .map(ensure_object)
            .unwrap_or_else(|| json!({}));
        Self {
            call_id,
            name,
            arguments,
        }
    }

    /// OpenAI wire form, arguments re-serialized to a JSON string.
    pub fn to_openai(&self) -> Value {
        json!({
            "id": self.call_id,
            "type": "function",
            "function": {
                "name": self.name,
                "arguments": serde_json::to_string(&self.arguments).unwrap_or_else(|_| "{}".into()),
            }
        })
    }
}

fn ensure_object(value: Value) -> Value {
    if let Value::String(ref s) = value {
        if let Ok(parsed @ Value::Object(_)) = serde_json::from_str::<Value>(s) {
            return parsed;
        }
    }
    if value.is_object() { value } else { json!({}) }
}

/// The string fed back to the LLM for one completed intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub call_id: String,
    pub content: String,
}

impl ToolOutcome {
    pub fn new(call_id: impl Into<String>, result: &Value) -> Self {
        Self {
            call_id: call_id.into(),
            content: serde_json::to_string(result).unwrap_or_else(|_| "{}".into()),
        }
    }
}

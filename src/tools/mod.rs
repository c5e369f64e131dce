//! Tool fabric: descriptors, invokers, and schema normalization.
//!
//! Built-in closures, dynamically generated bundles, and remote tool
//! servers all sit behind [`ToolInvoker`] and dispatch through the
//! registry.

pub mod builtin;
pub mod intent;
pub mod registry;
pub mod remote;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::sync::{Arc, LazyLock};

pub use registry::{RegistryEvent, ToolRegistry};

pub static TOOL_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("tool name pattern compiles"));

pub fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty() && TOOL_NAME_PATTERN.is_match(name)
}

const MAX_DESCRIPTION_LEN: usize = 1024;

/// Where a tool's implementation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOrigin {
    Builtin,
    Dynamic,
    RemoteStdio,
    RemoteHttp,
}

/// Executes one tool call. Implementations return the JSON value fed back
/// to the LLM; errors are converted to `{"error": ...}` by the registry.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, arguments: Value) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`ToolInvoker`].
pub struct FnInvoker<F>(pub F);

#[async_trait]
impl<F> ToolInvoker for FnInvoker<F>
where
    F: Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync,
{
    async fn invoke(&self, arguments: Value) -> anyhow::Result<Value> {
        (self.0)(arguments).await
    }
}

/// One registered tool.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON-Schema-shaped parameter object.
    pub parameters: Value,
    pub origin: ToolOrigin,
    pub invoker: Arc<dyn ToolInvoker>,
    pub tags: Vec<String>,
    pub enabled: bool,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        origin: ToolOrigin,
        invoker: Arc<dyn ToolInvoker>,
    ) -> Self {
        let mut description = description.into();
        description.truncate(MAX_DESCRIPTION_LEN);
        Self {
            name: name.into(),
            description,
            parameters: normalize_schema(parameters),
            origin,
            invoker,
            tags: vec![],
            enabled: true,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// OpenAI function-calling shape for the LLM catalog.
    pub fn openai_definition(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Collapse a free-text type annotation onto the JSON-Schema base set.
/// `"list[str]"` → `"array"`, `"Optional[int]"` → `"integer"`, unknown →
/// `"string"`.
pub fn normalize_param_type(raw: &str) -> &'static str {
    match raw {
        "string" => return "string",
        "integer" => return "integer",
        "number" => return "number",
        "boolean" => return "boolean",
        "array" => return "array",
        "object" => return "object",
        _ => {}
    }
    let lowered = raw.to_lowercase().replace(' ', "");
    if lowered.contains("int") {
        "integer"
    } else if lowered.contains("float") || lowered.contains("number") {
        "number"
    } else if lowered.contains("bool") {
        "boolean"
    } else if lowered.contains("list") || lowered.contains("array") {
        "array"
    } else if lowered.contains("dict") || lowered.contains("object") {
        "object"
    } else {
        "string"
    }
}

/// Re-normalize a parameter schema regardless of how it was authored:
/// every property's `type` collapses onto the base set, and the outer
/// object shape is enforced.
pub fn normalize_schema(schema: Value) -> Value {
    let Value::Object(map) = schema else {
        return json!({"type": "object", "properties": {}});
    };
    let mut out = Map::new();
    out.insert("type".into(), json!("object"));

    let mut properties = Map::new();
    if let Some(Value::Object(props)) = map.get("properties") {
        for (pname, pvalue) in props {
            properties.insert(pname.clone(), normalize_property(pvalue));
        }
    }
    out.insert("properties".into(), Value::Object(properties));

    if let Some(required) = map.get("required").filter(|r| r.is_array()) {
        out.insert("required".into(), required.clone());
    }
    Value::Object(out)
}

fn normalize_property(property: &Value) -> Value {
    let Value::Object(prop) = property else {
        return json!({"type": "string"});
    };
    let mut out = prop.clone();
    let raw_type = prop.get("type").and_then(Value::as_str).unwrap_or("string");
    out.insert("type".into(), json!(normalize_param_type(raw_type)));
    Value::Object(out)
}

/// Build a JSON-Schema parameter object from a probe-style map of
/// `name → {type, required, default?}`.
pub fn schema_from_probe_params(params: &Map<String, Value>) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for (pname, pinfo) in params {
        let raw_type = pinfo.get("type").and_then(Value::as_str).unwrap_or("string");
        properties.insert(
            pname.clone(),
            json!({"type": normalize_param_type(raw_type), "description": pname}),
        );
        if pinfo.get("required").and_then(Value::as_bool).unwrap_or(false) {
            required.push(json!(pname));
        }
    }
    let mut schema = Map::new();
    schema.insert("type".into(), json!("object"));
    schema.insert("properties".into(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".into(), Value::Array(required));
    }
    Value::Object(schema)
}

#[cfg(test)]
pub(crate) fn echo_invoker() -> Arc<dyn ToolInvoker> {
    Arc::new(FnInvoker(|args: Value| -> BoxFuture<'static, anyhow::Result<Value>> {
        Box::pin(async move { Ok(json!({"echoed": args})) })
    }))
}

//! Built-in tools: memory recall/retain and skill management.

use crate::forge::ForgeCoordinator;
use crate::memory::{DEFAULT_BANK, MemoryCapture};
use crate::tools::{FnInvoker, ToolDescriptor, ToolOrigin, ToolRegistry};
use anyhow::Result;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use std::sync::Arc;

/// Tools that manage the skill lifecycle. Filtered out of the catalog for
/// plain chat/question turns so the model cannot misfire them.
pub const SKILL_MGMT_TOOLS: &[&str] = &["create_skill", "list_skills", "delete_skill"];

pub fn is_skill_management_tool(name: &str) -> bool {
    SKILL_MGMT_TOOLS.contains(&name)
}

fn bank_from(args: &Value) -> String {
    args.get("bank_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_BANK)
        .to_string()
}

/// Register the built-in catalog.
pub fn register_builtin_tools(
    registry: &ToolRegistry,
    memory: Arc<MemoryCapture>,
    coordinator: Arc<ForgeCoordinator>,
) -> Result<()> {
    let recall_memory = {
        let memory = memory.clone();
        ToolDescriptor::new(
            "recall_memory",
            "Search long-term memory about the user: their name, preferences, and things mentioned in earlier conversations.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "what to look for"},
                    "bank_id": {"type": "string", "description": "memory bank (optional)"},
                },
                "required": ["query"],
            }),
            ToolOrigin::Builtin,
            Arc::new(FnInvoker(move |args: Value| -> BoxFuture<'static, Result<Value>> {
                let memory = memory.clone();
                Box::pin(async move {
                    let query = args.get("query").and_then(Value::as_str).unwrap_or("").to_string();
                    let bank = bank_from(&args);
                    match memory.recall(&query, &bank).await {
                        Ok(result) => Ok(serde_json::to_value(result)?),
                        Err(e) => Ok(json!({"error": e.to_string()})),
                    }
                })
            })),
        )
    };

    let retain_memory = {
        let memory = memory.clone();
        ToolDescriptor::new(
            "retain_memory",
            "Save an important piece of information to long-term memory: the user's name, preferences, or facts worth keeping.",
            json!({
                "type": "object",
                "properties": {
                    "content": {"type": "string", "description": "what to remember"},
                    "bank_id": {"type": "string", "description": "memory bank (optional)"},
                },
                "required": ["content"],
            }),
            ToolOrigin::Builtin,
            Arc::new(FnInvoker(move |args: Value| -> BoxFuture<'static, Result<Value>> {
                let memory = memory.clone();
                Box::pin(async move {
                    let content = args.get("content").and_then(Value::as_str).unwrap_or("").to_string();
                    let bank = bank_from(&args);
                    match memory.retain(&content, "", &bank).await {
                        Ok(receipt) => Ok(json!({"status": "saved", "bank_id": receipt.bank_id, "content": content})),
                        Err(e) => Ok(json!({"error": e.to_string()})),
                    }
                })
            })),
        )
    };

    let create_skill = {
        let coordinator = coordinator.clone();
        ToolDescriptor::new(
            "create_skill",
            "Generate a brand-new tool/skill. Call this once when the user asks for a capability that does not exist yet; generation runs in the background and is announced on completion. Do not call again while one is generating.",
            json!({
                "type": "object",
                "properties": {
                    "description": {"type": "string", "description": "what the new tool should do"},
                },
                "required": ["description"],
            }),
            ToolOrigin::Builtin,
            Arc::new(FnInvoker(move |args: Value| -> BoxFuture<'static, Result<Value>> {
                let coordinator = coordinator.clone();
                Box::pin(async move {
                    let description = args
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    if description.is_empty() {
                        return Ok(json!({"error": "description is required"}));
                    }
                    Ok(coordinator.request_skill(description))
                })
            })),
        )
    };

    let list_skills = {
        let coordinator = coordinator.clone();
        ToolDescriptor::new(
            "list_skills",
            "List the installed skills with their descriptions and enabled state.",
            json!({"type": "object", "properties": {}}),
            ToolOrigin::Builtin,
            Arc::new(FnInvoker(move |_args: Value| -> BoxFuture<'static, Result<Value>> {
                let coordinator = coordinator.clone();
                Box::pin(async move { Ok(coordinator.list_skills()) })
            })),
        )
    };

    let delete_skill = {
        let coordinator = coordinator.clone();
        ToolDescriptor::new(
            "delete_skill",
            "Delete an auto-generated skill by name. The deletion is remembered so the skill is not recreated.",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "skill name"},
                },
                "required": ["name"],
            }),
            ToolOrigin::Builtin,
            Arc::new(FnInvoker(move |args: Value| -> BoxFuture<'static, Result<Value>> {
                let coordinator = coordinator.clone();
                Box::pin(async move {
                    let name = args.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                    match coordinator.delete_skill(&name).await {
                        Ok(result) => Ok(result),
                        Err(e) => Ok(json!({"error": e.to_string()})),
                    }
                })
            })),
        )
    };

    for descriptor in [recall_memory, retain_memory, create_skill, list_skills, delete_skill] {
        registry.register(descriptor)?;
    }
    Ok(())
}

//! LLM capability contract and wire types.
//!
//! Provider HTTP clients live outside the core; they plug in through
//! [`LlmClient`]. The router (C12) resolves models and fallback order.

pub mod openai_compat;
pub mod prompts;
pub mod router;

use crate::tools::intent::ToolCallIntent;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use router::LlmRouter;

/// A chat message in OpenAI wire shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallIntent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Vec<ToolCallIntent>>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls,
            ..Default::default()
        }
    }

    pub fn tool_outcome(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            ..Default::default()
        }
    }

    /// Map loose role spellings onto the OpenAI wire roles.
    pub fn normalize_role(role: &str) -> &str {
        match role {
            "human" => "user",
            "ai" => "assistant",
            other => other,
        }
    }
}

/// Response format constraint (JSON mode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFormat {
    JsonObject,
}

/// Parameters for one completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Tool catalog in OpenAI function-calling shape.
    pub tools: Option<Vec<Value>>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub response_format: Option<ResponseFormat>,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            tools: None,
            temperature: 0.7,
            max_tokens: 4096,
            timeout_secs: 120,
            response_format: None,
        }
    }
}

/// Non-streaming completion result.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallIntent>,
    /// Model that actually served the call.
    pub model: String,
}

impl Completion {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// One tool-call delta inside a streamed chunk. Arguments arrive as string
/// fragments to be concatenated per `index`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// One decoded streaming chunk.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub delta_content: Option<String>,
    pub tool_call_deltas: Vec<ToolCallDelta>,
}

/// External LLM provider contract.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, model: &str, request: CompletionRequest) -> anyhow::Result<Completion>;

    /// Open a streaming call. The returned stream is dropped to cancel the
    /// underlying provider request.
    async fn stream(
        &self,
        model: &str,
        request: CompletionRequest,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<StreamChunk>>>;
}

/// Model role labels selecting a fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Reason,
    Code,
    Chat,
    Classify,
    Extract,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reason => "reason",
            Self::Code => "code",
            Self::Chat => "chat",
            Self::Classify => "classify",
            Self::Extract => "extract",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reason" => Some(Self::Reason),
            "code" => Some(Self::Code),
            "chat" => Some(Self::Chat),
            "classify" => Some(Self::Classify),
            "extract" => Some(Self::Extract),
            _ => None,
        }
    }
}

//! OpenAI-compatible chat-completions client.
//!
//! All three supported providers expose this wire shape (OpenAI natively,
//! Gemini and Anthropic through their compatibility endpoints), so one
//! client serves every router slot; only the base URL and credential
//! differ.

use crate::llm::{
    ChatMessage, Completion, CompletionRequest, LlmClient, ResponseFormat, StreamChunk, ToolCallDelta,
};
use crate::tools::intent::ToolCallIntent;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const GEMINI_COMPAT_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions";
const ANTHROPIC_COMPAT_URL: &str = "https://api.anthropic.com/v1/chat/completions";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OpenAiCompatClient {
    api_key: String,
    base_url: String,
    provider_name: String,
    client: Client,
}

impl OpenAiCompatClient {
    pub fn with_config(api_key: String, base_url: String, provider_name: String) -> Self {
        Self {
            api_key,
            base_url,
            provider_name,
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn openai(api_key: String) -> Self {
        Self::with_config(api_key, OPENAI_URL.to_string(), "OpenAI".to_string())
    }

    pub fn gemini(api_key: String) -> Self {
        Self::with_config(api_key, GEMINI_COMPAT_URL.to_string(), "Gemini".to_string())
    }

    pub fn anthropic(api_key: String) -> Self {
        Self::with_config(api_key, ANTHROPIC_COMPAT_URL.to_string(), "Anthropic".to_string())
    }

    /// `gemini/gemini-3-flash` → `gemini-3-flash`; bare ids pass through.
    fn wire_model(model: &str) -> &str {
        model.split_once('/').map_or(model, |(_, rest)| rest)
    }

    fn wire_message(message: &ChatMessage) -> Value {
        let mut out = json!({
            "role": message.role,
            "content": message.content,
        });
        if let Some(ref tool_calls) = message.tool_calls {
            out["tool_calls"] = Value::Array(tool_calls.iter().map(ToolCallIntent::to_openai).collect());
        }
        if let Some(ref tool_call_id) = message.tool_call_id {
            out["tool_call_id"] = json!(tool_call_id);
        }
        out
    }

    fn build_payload(&self, model: &str, request: &CompletionRequest, stream: bool) -> Value {
        let mut payload = json!({
            "model": Self::wire_model(model),
            "messages": request.messages.iter().map(Self::wire_message).collect::<Vec<_>>(),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if let Some(ref tools) = request.tools {
            payload["tools"] = json!(tools);
        }
        if request.response_format == Some(ResponseFormat::JsonObject) {
            payload["response_format"] = json!({"type": "json_object"});
        }
        if stream {
            payload["stream"] = json!(true);
        }
        payload
    }

    fn parse_completion(json: &Value) -> Result<Completion> {
        let message = json["choices"]
            .as_array()
            .and_then(|choices| choices.first())
            .map(|choice| &choice["message"])
            .context("no choices in completion response")?;

        let content = message["content"].as_str().map(str::to_string).filter(|c| !c.is_empty());
        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| calls.iter().map(ToolCallIntent::parse).collect())
            .unwrap_or_default();

        Ok(Completion {
            content,
            tool_calls,
            model: String::new(),
        })
    }
}

/// Decode one streamed chunk object into text/tool deltas.
fn decode_chunk(value: &Value) -> StreamChunk {
    let delta = &value["choices"][0]["delta"];
    let delta_content = delta["content"].as_str().filter(|c| !c.is_empty()).map(str::to_string);
    let tool_call_deltas = delta["tool_calls"]
        .as_array()
        .map(|deltas| {
            deltas
                .iter()
                .map(|d| ToolCallDelta {
                    index: d["index"].as_u64().unwrap_or(0) as usize,
                    id: d["id"].as_str().map(str::to_string),
                    name: d["function"]["name"].as_str().map(str::to_string),
                    arguments: d["function"]["arguments"].as_str().map(str::to_string),
                })
                .collect()
        })
        .unwrap_or_default();
    StreamChunk {
        delta_content,
        tool_call_deltas,
    }
}

/// Drain complete SSE events (terminated by a blank line) from `buffer`,
/// returning the parsed `data:` payloads. `[DONE]` yields `None` items.
fn drain_sse_events(buffer: &mut String) -> Vec<Option<Value>> {
    let mut events = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let event: String = buffer.drain(..pos + 2).collect();
        let mut data = String::new();
        for line in event.lines() {
            if let Some(rest) = line.strip_prefix("data: ") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(rest);
            }
        }
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            events.push(None);
        } else {
            events.push(serde_json::from_str(data).ok());
        }
    }
    events
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(&self, model: &str, request: CompletionRequest) -> Result<Completion> {
        let payload = self.build_payload(model, &request, false);
        let response = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(Duration::from_secs(request.timeout_secs))
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.provider_name))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "{} returned {}: {:.300}",
                self.provider_name,
                status,
                body
            ));
        }

        let json: Value = response.json().await.context("malformed completion body")?;
        debug!(provider = %self.provider_name, model, "completion received");
        Self::parse_completion(&json)
    }

    async fn stream(
        &self,
        model: &str,
        request: CompletionRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let payload = self.build_payload(model, &request, true);
        let response = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(Duration::from_secs(request.timeout_secs))
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("stream request to {} failed", self.provider_name))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{} returned {}: {:.300}", self.provider_name, status, body));
        }

        let provider = self.provider_name.clone();
        let (tx, rx) = mpsc::channel::<Result<StreamChunk>>(32);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(next) = bytes.next().await {
                let chunk = match next {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(provider = %provider, error = %e, "stream transport error");
                        let _ = tx.send(Err(anyhow!("stream transport error: {}", e))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                for event in drain_sse_events(&mut buffer) {
                    match event {
                        Some(value) => {
                            if tx.send(Ok(decode_chunk(&value))).await.is_err() {
                                // consumer gone; dropping `response` aborts
                                // the provider call
                                return;
                            }
                        }
                        None => return, // [DONE]
                    }
                }
            }
        });

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

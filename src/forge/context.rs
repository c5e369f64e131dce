//! Shared capability service for generated skills.
//!
//! Generated code never holds LLM or memory handles. It calls
//! `llm_complete` / `llm_chat` / `memory_retain` / `memory_recall` in the
//! shim module, which round-trips over a Unix socket to this server. The
//! wire shape mirrors the vault protocol: one JSON object per connection
//! in each direction.

use crate::llm::{ChatMessage, LlmRouter};
use crate::memory::{MemoryCapture, SKILL_BANK};
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, warn};

const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
const TEMPERATURE_MIN: f32 = 0.0;
const TEMPERATURE_MAX: f32 = 1.5;
const MAX_TOKENS_CAP: u32 = 2048;

static SERVICES: OnceLock<Arc<SkillServices>> = OnceLock::new();

/// Process-wide handles exposed to generated skills, with clamps applied
/// at this boundary.
pub struct SkillServices {
    router: Arc<LlmRouter>,
    memory: Arc<MemoryCapture>,
}

impl SkillServices {
    pub fn new(router: Arc<LlmRouter>, memory: Arc<MemoryCapture>) -> Self {
        Self { router, memory }
    }

    fn clamp(temperature: f32, max_tokens: u32) -> (f32, u32) {
        (
            temperature.clamp(TEMPERATURE_MIN, TEMPERATURE_MAX),
            max_tokens.min(MAX_TOKENS_CAP),
        )
    }

    pub async fn llm_complete(
        &self,
        prompt: &str,
        system: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String> {
        let (temperature, max_tokens) = Self::clamp(temperature, max_tokens);
        self.router
            .complete_text(prompt, system, None, Some(temperature), Some(max_tokens))
            .await
            .map_err(|e| anyhow!("{}", e))
    }

    pub async fn llm_chat(
        &self,
        messages: Vec<ChatMessage>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String> {
        let (temperature, max_tokens) = Self::clamp(temperature, max_tokens);
        let completion = self
            .router
            .complete_with(messages, None, None, None, Some(temperature), Some(max_tokens), None)
            .await
            .map_err(|e| anyhow!("{}", e))?;
        Ok(completion.content.unwrap_or_default())
    }

    pub async fn memory_retain(&self, content: &str, context: &str, bank_id: Option<&str>) -> Result<Value> {
        let receipt = self
            .memory
            .retain(content, context, bank_id.unwrap_or(SKILL_BANK))
            .await?;
        Ok(serde_json::to_value(receipt)?)
    }

    pub async fn memory_recall(&self, query: &str, bank_id: Option<&str>) -> Result<Value> {
        let result = self.memory.recall(query, bank_id.unwrap_or(SKILL_BANK)).await?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Install the process-wide services. Later calls keep the first value.
pub fn initialize(services: Arc<SkillServices>) {
    if SERVICES.set(services).is_err() {
        warn!("skill context already initialized");
    } else {
        info!("skill context initialized");
    }
}

pub fn is_initialized() -> bool {
    SERVICES.get().is_some()
}

/// The installed services. Calling before [`initialize`] is a loud error.
pub fn services() -> Result<Arc<SkillServices>> {
    SERVICES
        .get()
        .cloned()
        .ok_or_else(|| anyhow!("skill context is not initialized"))
}

#[derive(Debug, Deserialize)]
struct ContextRequest {
    op: String,
    #[serde(default)]
    data: Value,
}

/// Unix-socket server bridging the Python shim to [`SkillServices`].
pub struct ContextServer {
    socket_path: PathBuf,
    services: Arc<SkillServices>,
}

impl ContextServer {
    pub fn new(socket_path: PathBuf, services: Arc<SkillServices>) -> Self {
        Self {
            socket_path,
            services,
        }
    }

    /// Bind the socket and serve forever. Intended to run on its own task.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("failed to bind {}", self.socket_path.display()))?;
        info!(socket = %self.socket_path.display(), "skill context server started");

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            error!(error = %e, "skill context connection error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "skill context accept failed"),
            }
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_SIZE as u64)
            .read_to_end(&mut buf)
            .await?;
        if buf.is_empty() {
            return Ok(());
        }

        let response = match serde_json::from_slice::<ContextRequest>(&buf) {
            Ok(request) => self.dispatch(request).await,
            Err(_) => json!({"ok": false, "error": "invalid JSON request"}),
        };
        stream.write_all(serde_json::to_string(&response)?.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn dispatch(&self, request: ContextRequest) -> Value {
        let data = &request.data;
        let result = match request.op.as_str() {
            "llm_complete" => {
                let prompt = data.get("prompt").and_then(Value::as_str).unwrap_or("");
                let system = data.get("system").and_then(Value::as_str).unwrap_or("");
                let temperature = data.get("temperature").and_then(Value::as_f64).unwrap_or(0.7) as f32;
                let max_tokens = data.get("max_tokens").and_then(Value::as_u64).unwrap_or(1024) as u32;
                self.services
                    .llm_complete(prompt, system, temperature, max_tokens)
                    .await
                    .map(Value::String)
            }
            "llm_chat" => {
                let messages: Vec<ChatMessage> = data
                    .get("messages")
                    .and_then(|m| serde_json::from_value(m.clone()).ok())
                    .unwrap_or_default();
                let temperature = data.get("temperature").and_then(Value::as_f64).unwrap_or(0.7) as f32;
                let max_tokens = data.get("max_tokens").and_then(Value::as_u64).unwrap_or(1024) as u32;
                self.services
                    .llm_chat(messages, temperature, max_tokens)
                    .await
                    .map(Value::String)
            }
            "memory_retain" => {
                let content = data.get("content").and_then(Value::as_str).unwrap_or("");
                let context = data.get("context").and_then(Value::as_str).unwrap_or("");
                let bank = data.get("bank_id").and_then(Value::as_str);
                self.services.memory_retain(content, context, bank).await
            }
            "memory_recall" => {
                let query = data.get("query").and_then(Value::as_str).unwrap_or("");
                let bank = data.get("bank_id").and_then(Value::as_str);
                self.services.memory_recall(query, bank).await
            }
            other => Err(anyhow!("unknown operation: {}", other)),
        };

        match result {
            Ok(data) => json!({"ok": true, "data": data}),
            Err(e) => json!({"ok": false, "error": e.to_string()}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use crate::llm::router::ProviderKind;
    use crate::llm::{Completion, CompletionRequest, LlmClient, StreamChunk};
    use crate::memory::signal::SensitiveDetector;
    use crate::memory::{MemoryEngine, RecallResult, ReflectReceipt, RetainReceipt};
    use async_trait::async_trait;
    use futures_util::stream::BoxStream;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct CapturingClient {
        last_request: Mutex<Option<CompletionRequest>>,
    }

    #[async_trait]
    impl LlmClient for CapturingClient {
        async fn complete(&self, _model: &str, request: CompletionRequest) -> anyhow::Result<Completion> {
            let reply = format!("t={} mt={}", request.temperature, request.max_tokens);
            *self.last_request.lock().unwrap() = Some(request);
            Ok(Completion {
                content: Some(reply),
                ..Default::default()
            })
        }

        async fn stream(
            &self,
            _model: &str,
            _request: CompletionRequest,
        ) -> anyhow::Result<BoxStream<'static, anyhow::Result<StreamChunk>>> {
            anyhow::bail!("not used")
        }
    }

    struct NullEngine;

    #[async_trait]
    impl MemoryEngine for NullEngine {
        async fn retain(&self, text: &str, _context: &str, bank_id: &str) -> anyhow::Result<RetainReceipt> {
            Ok(RetainReceipt {
                status: "ok".into(),
                bank_id: bank_id.into(),
                content_length: text.len(),
                facts_detected: 0,
                log_path: None,
            })
        }

        async fn recall(&self, query: &str, bank_id: &str) -> anyhow::Result<RecallResult> {
            Ok(RecallResult::empty(query, bank_id))
        }

        async fn reflect(&self, bank_id: &str) -> anyhow::Result<ReflectReceipt> {
            Ok(ReflectReceipt {
                status: "ok".into(),
                bank_id: bank_id.into(),
                indexed_files: 0,
            })
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn services() -> Arc<SkillServices> {
        let mut clients: HashMap<ProviderKind, Arc<dyn LlmClient>> = HashMap::new();
        clients.insert(
            ProviderKind::OpenAi,
            Arc::new(CapturingClient {
                last_request: Mutex::new(None),
            }),
        );
        let router = Arc::new(
            LlmRouter::new(
                &LlmConfig {
                    models: vec!["gpt-5-mini".into()],
                    ..Default::default()
                },
                clients,
            )
            .unwrap(),
        );
        let memory = Arc::new(MemoryCapture::new(Arc::new(NullEngine), None, SensitiveDetector::new()));
        Arc::new(SkillServices::new(router, memory))
    }

    #[tokio::test]
    async fn temperature_and_token_clamps_apply() {
        let s = services();
        let reply = s.llm_complete("hi", "", 9.0, 999_999).await.unwrap();
        assert_eq!(reply, "t=1.5 mt=2048");
        let reply = s.llm_complete("hi", "", -3.0, 64).await.unwrap();
        assert_eq!(reply, "t=0 mt=64");
    }

    #[tokio::test]
    async fn retain_defaults_to_skill_bank() {
        let s = services();
        let receipt = s.memory_retain("content", "", None).await.unwrap();
        assert_eq!(receipt["bank_id"], SKILL_BANK);
        let receipt = s.memory_retain("content", "", Some("other")).await.unwrap();
        assert_eq!(receipt["bank_id"], "other");
    }

    #[tokio::test]
    async fn server_round_trip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ctx.sock");
        let server = Arc::new(ContextServer::new(socket.clone(), services()));
        let handle = tokio::spawn(server.run());
        for _ in 0..50 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        stream
            .write_all(br#"{"op":"llm_complete","data":{"prompt":"hi","temperature":0.2,"max_tokens":10}}"#)
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let response: Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(response["ok"], true);
        assert_eq!(response["data"], "t=0.2 mt=10");
        handle.abort();
    }

    #[tokio::test]
    async fn unknown_op_errors() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ctx.sock");
        let server = Arc::new(ContextServer::new(socket.clone(), services()));
        let handle = tokio::spawn(server.run());
        for _ in 0..50 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        stream.write_all(br#"{"op":"rm_rf"}"#).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let response: Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(response["ok"], false);
        handle.abort();
    }
}

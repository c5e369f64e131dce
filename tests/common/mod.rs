//! Shared doubles for the integration suites.

use adjutant::config::LlmConfig;
use adjutant::llm::router::ProviderKind;
use adjutant::llm::{Completion, CompletionRequest, LlmClient, LlmRouter, StreamChunk};
use adjutant::tools::intent::ToolCallIntent;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[allow(dead_code)]
pub enum Reply {
    Text(String),
    ToolCall(ToolCallIntent),
    /// Answer with whatever the memory section of the system prompt holds.
    EchoMemory,
}

/// LLM double replaying a script of completions and streams.
pub struct ScriptedLlm {
    completes: Mutex<VecDeque<Reply>>,
    streams: Mutex<VecDeque<Vec<StreamChunk>>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new(completes: Vec<Reply>, streams: Vec<Vec<StreamChunk>>) -> Self {
        Self {
            completes: Mutex::new(completes.into()),
            streams: Mutex::new(streams.into()),
            requests: Mutex::new(vec![]),
        }
    }
}

fn memory_section(request: &CompletionRequest) -> String {
    request
        .messages
        .iter()
        .find(|m| m.role == "system")
        .and_then(|m| m.content.split("관련 기억:\n").nth(1))
        .unwrap_or("")
        .to_string()
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, model: &str, request: CompletionRequest) -> anyhow::Result<Completion> {
        let reply = self.completes.lock().unwrap().pop_front();
        self.requests.lock().unwrap().push(request.clone());
        match reply {
            Some(Reply::Text(text)) => Ok(Completion {
                content: Some(text),
                tool_calls: vec![],
                model: model.to_string(),
            }),
            Some(Reply::ToolCall(intent)) => Ok(Completion {
                content: None,
                tool_calls: vec![intent],
                model: model.to_string(),
            }),
            Some(Reply::EchoMemory) => Ok(Completion {
                content: Some(memory_section(&request)),
                tool_calls: vec![],
                model: model.to_string(),
            }),
            None => anyhow::bail!("complete script exhausted"),
        }
    }

    async fn stream(
        &self,
        _model: &str,
        request: CompletionRequest,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<StreamChunk>>> {
        self.requests.lock().unwrap().push(request);
        match self.streams.lock().unwrap().pop_front() {
            Some(chunks) => Ok(futures_util::stream::iter(chunks.into_iter().map(Ok)).boxed()),
            None => anyhow::bail!("stream script exhausted"),
        }
    }
}

pub fn router_with(client: Arc<ScriptedLlm>) -> Arc<LlmRouter> {
    let mut clients: HashMap<ProviderKind, Arc<dyn LlmClient>> = HashMap::new();
    clients.insert(ProviderKind::OpenAi, client);
    Arc::new(
        LlmRouter::new(
            &LlmConfig {
                models: vec!["gpt-5-mini".into()],
                ..Default::default()
            },
            clients,
        )
        .expect("router builds"),
    )
}

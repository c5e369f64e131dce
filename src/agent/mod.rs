//! The reason-act loop: recall → reason → execute ⟲ → retain, in a
//! blocking variant and a token-streaming variant.

use crate::errors::AdjutantError;
use crate::llm::prompts::PromptRegistry;
use crate::llm::{ChatMessage, LlmRouter, Role, ToolCallDelta};
use crate::memory::MemoryCapture;
use crate::tasks::TaskTracker;
use crate::tools::ToolRegistry;
use crate::tools::builtin::is_skill_management_tool;
use crate::tools::intent::ToolCallIntent;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Upper bound on tool-call batches per turn.
pub const MAX_TOOL_CALLS: usize = 10;

const RECALL_TIMEOUT: Duration = Duration::from_secs(3);
const MEMORY_SECTION_PREFIX: &str = "관련 기억:\n";

const CLASSIFY_SYSTEM_PROMPT: &str = "사용자 메시지의 의도를 한 단어로만 분류하세요. \
선택지: chat, question, remember, skill_request, complex\n한 단어만 답하세요.";

/// Who this turn belongs to; also selects the memory bank.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub user_id: String,
    pub channel: String,
    pub bank_id: String,
}

impl TurnContext {
    pub fn new(channel: impl Into<String>, user_id: impl Into<String>) -> Self {
        let channel = channel.into();
        let user_id = user_id.into();
        let bank_id = format!("{}-{}", channel, user_id);
        Self {
            user_id,
            channel,
            bank_id,
        }
    }
}

#[derive(Clone)]
pub struct AgentLoop {
    router: Arc<LlmRouter>,
    memory: Arc<MemoryCapture>,
    registry: Arc<ToolRegistry>,
    prompts: Arc<PromptRegistry>,
    retains: Arc<TaskTracker>,
}

impl AgentLoop {
    pub fn new(
        router: Arc<LlmRouter>,
        memory: Arc<MemoryCapture>,
        registry: Arc<ToolRegistry>,
        prompts: Arc<PromptRegistry>,
    ) -> Self {
        Self {
            router,
            memory,
            registry,
            prompts,
            retains: Arc::new(TaskTracker::new()),
        }
    }

    /// Background-retain live-set, awaited (or cancelled) at shutdown.
    pub fn retain_tracker(&self) -> Arc<TaskTracker> {
        self.retains.clone()
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry.clone()
    }

    // ------------------------------------------------------------------
    // Blocking variant
    // ------------------------------------------------------------------

    /// Run one full turn and return the final assistant text.
    pub async fn run(
        &self,
        user_message: &str,
        history: &[ChatMessage],
        turn: &TurnContext,
    ) -> Result<String, AdjutantError> {
        let mut messages: Vec<ChatMessage> = history.to_vec();
        messages.push(ChatMessage::user(user_message));

        let memory_context = self.recall_context(&messages, &turn.bank_id).await;
        let mut batches = 0usize;

        loop {
            let llm_messages = self.compose(&memory_context, &messages);
            let tools = self.published_tools(None);
            let completion = self.router.complete(llm_messages, tools, None, None).await?;

            if completion.has_tool_calls() && batches < MAX_TOOL_CALLS {
                messages.push(ChatMessage::assistant(
                    completion.content.clone().unwrap_or_default(),
                    Some(completion.tool_calls.clone()),
                ));
                // outcomes are appended in intent order
                for intent in &completion.tool_calls {
                    let outcome = self.registry.dispatch(intent, &turn.user_id, &turn.channel).await;
                    messages.push(ChatMessage::tool_outcome(outcome.call_id, outcome.content));
                }
                batches += 1;
                continue;
            }

            let final_text = completion.content.unwrap_or_default();
            self.spawn_retain(user_message, &final_text, &turn.bank_id).await;
            debug!(batches, "turn finished");
            return Ok(final_text);
        }
    }

    // ------------------------------------------------------------------
    // Streaming variant
    // ------------------------------------------------------------------

    /// Start a streaming turn. Tokens arrive through the returned stream in
    /// provider order; dropping the stream cancels the in-flight LLM call.
    pub async fn run_stream(
        &self,
        user_message: &str,
        history: &[ChatMessage],
        turn: &TurnContext,
    ) -> ResponseStream {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        let user_message = user_message.to_string();
        let history = history.to_vec();
        let turn = turn.clone();
        let handle = tokio::spawn(async move {
            this.stream_turn(&user_message, &history, &turn, tx).await;
        });
        ResponseStream {
            rx,
            handle,
        }
    }

    async fn stream_turn(
        &self,
        user_message: &str,
        history: &[ChatMessage],
        turn: &TurnContext,
        tx: mpsc::Sender<Result<String, AdjutantError>>,
    ) {
        let mut messages: Vec<ChatMessage> = history.to_vec();
        messages.push(ChatMessage::user(user_message));

        let memory_context = self.recall_context(&messages, &turn.bank_id).await;
        let intent = self.classify_intent(user_message).await;
        let role = match intent.as_str() {
            "complex" => Role::Reason,
            "skill_request" => Role::Code,
            _ => Role::Chat,
        };
        // plain chat must not see skill-management tools (misfire guard)
        let memory_only = matches!(intent.as_str(), "chat" | "question");
        let filter: Option<&(dyn Fn(&str) -> bool + Sync)> = if memory_only {
            Some(&is_skill_management_tool)
        } else {
            None
        };
        let tools = self.published_tools(filter);
        info!(intent = %intent, role = role.as_str(), "streaming turn classified");

        let mut llm_messages = self.compose(&memory_context, &messages);
        let mut content = String::new();
        let mut batches = 0usize;

        loop {
            let stream = match self
                .router
                .stream(llm_messages.clone(), tools.clone(), None, Some(role))
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            tokio::pin!(stream);

            let mut text_buf = String::new();
            let mut deltas: BTreeMap<usize, (String, String, String)> = BTreeMap::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(AdjutantError::Llm(e.to_string()))).await;
                        return;
                    }
                };
                if let Some(token) = chunk.delta_content {
                    if !token.is_empty() {
                        text_buf.push_str(&token);
                        content.push_str(&token);
                        if tx.send(Ok(token)).await.is_err() {
                            // consumer walked away; dropping the stream
                            // aborts the provider call
                            return;
                        }
                    }
                }
                for delta in chunk.tool_call_deltas {
                    accumulate_delta(&mut deltas, delta);
                }
            }

            if deltas.is_empty() || batches >= MAX_TOOL_CALLS {
                break;
            }

            let intents: Vec<ToolCallIntent> = deltas
                .into_values()
                .map(|(id, name, arguments)| {
                    let args: Value = serde_json::from_str(&arguments).unwrap_or_else(|_| json!({}));
                    ToolCallIntent::new(id, name, args)
                })
                .collect();

            llm_messages.push(ChatMessage::assistant(text_buf, Some(intents.clone())));
            for intent in &intents {
                let outcome = self.registry.dispatch(intent, &turn.user_id, &turn.channel).await;
                llm_messages.push(ChatMessage::tool_outcome(outcome.call_id, outcome.content));
            }
            batches += 1;
        }

        self.spawn_retain(user_message, &content, &turn.bank_id).await;
    }

    // ------------------------------------------------------------------
    // Shared steps
    // ------------------------------------------------------------------

    /// Recall step: query from the two most recent user messages under a
    /// hard deadline. Never fails the turn.
    async fn recall_context(&self, messages: &[ChatMessage], bank_id: &str) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for message in messages.iter().rev() {
            if ChatMessage::normalize_role(&message.role) == "user" && !message.content.is_empty() {
                parts.push(&message.content);
                if parts.len() >= 2 {
                    break;
                }
            }
        }
        if parts.is_empty() {
            return String::new();
        }
        parts.reverse();
        let query = parts.join(" ");

        match tokio::time::timeout(RECALL_TIMEOUT, self.memory.recall(&query, bank_id)).await {
            Ok(Ok(result)) => result.context,
            Ok(Err(e)) => {
                warn!(bank_id, error = %e, "recall failed, continuing without context");
                String::new()
            }
            Err(_) => {
                warn!(bank_id, "recall timed out, continuing without context");
                String::new()
            }
        }
    }

    /// Compose the LLM input: identity prompt, memory section, then the
    /// turn's messages normalized to wire roles.
    fn compose(&self, memory_context: &str, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut system_parts = Vec::new();
        let identity = self.prompts.identity();
        if !identity.is_empty() {
            system_parts.push(identity);
        }
        if !memory_context.is_empty() {
            system_parts.push(format!("{}{}", MEMORY_SECTION_PREFIX, memory_context));
        }

        let mut out = Vec::with_capacity(messages.len() + 1);
        if !system_parts.is_empty() {
            out.push(ChatMessage::system(system_parts.join("\n\n")));
        }
        for message in messages {
            out.push(ChatMessage {
                role: ChatMessage::normalize_role(&message.role).to_string(),
                content: message.content.clone(),
                tool_calls: message.tool_calls.clone(),
                tool_call_id: message.tool_call_id.clone(),
            });
        }
        out
    }

    /// The tool catalog, optionally filtered by an exclusion predicate.
    fn published_tools(&self, exclude: Option<&(dyn Fn(&str) -> bool + Sync)>) -> Option<Vec<Value>> {
        let defs = self.registry.openai_definitions();
        let defs: Vec<Value> = match exclude {
            Some(predicate) => defs
                .into_iter()
                .filter(|def| {
                    def["function"]["name"]
                        .as_str()
                        .is_none_or(|name| !predicate(name))
                })
                .collect(),
            None => defs,
        };
        if defs.is_empty() { None } else { Some(defs) }
    }

    /// Very small classification call; failures default to `chat`.
    async fn classify_intent(&self, user_message: &str) -> String {
        let result = self
            .router
            .complete_text(
                &format!("사용자: {}", user_message),
                CLASSIFY_SYSTEM_PROMPT,
                Some(Role::Classify),
                Some(0.0),
                Some(10),
            )
            .await;
        match result {
            Ok(raw) => {
                let word = raw.trim().to_lowercase();
                let word = word.split_whitespace().next().unwrap_or("chat").to_string();
                match word.as_str() {
                    "chat" | "question" | "remember" | "skill_request" | "complex" => word,
                    _ => "chat".to_string(),
                }
            }
            Err(e) => {
                debug!(error = %e, "intent classification failed, defaulting to chat");
                "chat".to_string()
            }
        }
    }

    /// Retain step: persist the turn's user/assistant pair in the
    /// background. The handle lives in the tracker until completion.
    async fn spawn_retain(&self, user_text: &str, assistant_text: &str, bank_id: &str) {
        let mut text = format!("user: {}", user_text);
        if !assistant_text.is_empty() {
            text.push_str(&format!("\nassistant: {}", assistant_text));
        }
        let memory = self.memory.clone();
        let bank = bank_id.to_string();
        let name = format!("retain_{}", uuid::Uuid::now_v7());
        self.retains
            .spawn_tracked(name, async move {
                if let Err(e) = memory.retain(&text, "", &bank).await {
                    warn!(bank_id = %bank, error = %e, "background retain failed");
                }
            })
            .await;
    }
}

fn accumulate_delta(deltas: &mut BTreeMap<usize, (String, String, String)>, delta: ToolCallDelta) {
    let entry = deltas.entry(delta.index).or_default();
    if let Some(id) = delta.id {
        entry.0 = id;
    }
    if let Some(name) = delta.name {
        entry.1 = name;
    }
    if let Some(arguments) = delta.arguments {
        entry.2.push_str(&arguments);
    }
}

/// Consumer handle for a streaming turn. Dropping it aborts the producing
/// task, which cascades into the provider stream.
pub struct ResponseStream {
    rx: mpsc::Receiver<Result<String, AdjutantError>>,
    handle: tokio::task::JoinHandle<()>,
}

impl ResponseStream {
    /// Next text token, or `None` when the turn is over.
    pub async fn next_token(&mut self) -> Option<Result<String, AdjutantError>> {
        self.rx.recv().await
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

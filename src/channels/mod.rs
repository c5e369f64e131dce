//! Channel fan-in: uniform envelope construction and the shared
//! per-message pipeline every front end runs through.

pub mod telegram;

use crate::agent::{AgentLoop, TurnContext};
use crate::envelope::{ChannelKind, Envelope, EnvelopeState};
use crate::errors::AdjutantError;
use crate::security::{AuditLog, PolicyDecisionPoint};
use crate::session::ConversationCache;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// User-facing text when a turn fails.
pub const APOLOGY: &str = "죄송합니다, 처리 중 오류가 발생했습니다";

/// Pseudo-tool name channels check against the policy before processing.
const CHANNEL_MESSAGE_TOOL: &str = "channel_message";

/// Shared per-turn pipeline: policy gate → agent run → buffer update, with
/// envelope state tracking throughout.
pub struct ChannelRuntime {
    agent: AgentLoop,
    sessions: Arc<ConversationCache>,
    pdp: Arc<PolicyDecisionPoint>,
    audit: Arc<AuditLog>,
}

impl ChannelRuntime {
    pub fn new(
        agent: AgentLoop,
        sessions: Arc<ConversationCache>,
        pdp: Arc<PolicyDecisionPoint>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            agent,
            sessions,
            pdp,
            audit,
        }
    }

    pub fn agent(&self) -> &AgentLoop {
        &self.agent
    }

    pub fn sessions(&self) -> Arc<ConversationCache> {
        self.sessions.clone()
    }

    /// Build the envelope for one inbound message.
    pub fn receive(
        &self,
        channel: ChannelKind,
        user_id: &str,
        user_name: &str,
        text: &str,
        metadata: HashMap<String, String>,
    ) -> Envelope {
        let mut envelope = Envelope::new(channel, user_id, text).with_user_name(user_name);
        envelope.metadata = metadata;
        envelope
    }

    /// Drive one envelope through authorization and the blocking loop.
    /// Returns the assistant text; the envelope ends in
    /// Completed / Failed / Denied.
    pub async fn process(&self, envelope: &mut Envelope) -> Result<String, AdjutantError> {
        let channel = envelope.channel.to_string();
        let (allowed, reason) = self.pdp.check(CHANNEL_MESSAGE_TOOL, &envelope.user_id, &channel);
        if !allowed {
            envelope.transition(EnvelopeState::Denied)?;
            envelope.error = reason.clone();
            self.audit.log_security_event(
                "message_denied",
                &envelope.user_id,
                HashMap::from([
                    ("reason".to_string(), json!(reason)),
                    ("channel".to_string(), json!(channel)),
                ]),
            );
            return Err(AdjutantError::Security(reason));
        }
        envelope.transition(EnvelopeState::Authorized)?;
        envelope.transition(EnvelopeState::Processing)?;

        let turn = TurnContext::new(channel.clone(), envelope.user_id.clone());
        let history = self.sessions.history(&channel, &envelope.user_id);

        match self.agent.run(&envelope.content, &history, &turn).await {
            Ok(response) => {
                self.sessions
                    .append_turn(&channel, &envelope.user_id, &envelope.content, &response);
                envelope.response = response.clone();
                envelope.transition(EnvelopeState::Completed)?;
                info!(
                    channel = %channel,
                    user_id = %envelope.user_id,
                    response_len = response.len(),
                    "turn completed"
                );
                Ok(response)
            }
            Err(e) => {
                envelope.error = e.to_string();
                envelope.transition(EnvelopeState::Failed)?;
                error!(channel = %channel, user_id = %envelope.user_id, error = %e, "turn failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LlmConfig, SecurityConfig};
    use crate::llm::prompts::PromptRegistry;
    use crate::llm::router::ProviderKind;
    use crate::llm::{Completion, CompletionRequest, LlmClient, LlmRouter, StreamChunk};
    use crate::memory::signal::SensitiveDetector;
    use crate::memory::{MemoryCapture, MemoryEngine, RecallResult, ReflectReceipt, RetainReceipt};
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;
    use futures_util::stream::BoxStream;

    struct FixedClient {
        reply: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl LlmClient for FixedClient {
        async fn complete(&self, model: &str, _request: CompletionRequest) -> anyhow::Result<Completion> {
            if self.fail {
                anyhow::bail!("provider down");
            }
            Ok(Completion {
                content: Some(self.reply.to_string()),
                tool_calls: vec![],
                model: model.to_string(),
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
        async fn retain(&self, text: &str, _c: &str, bank_id: &str) -> anyhow::Result<RetainReceipt> {
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

    fn runtime(reply: &'static str, fail: bool, rate_cap: usize) -> ChannelRuntime {
        let mut clients: std::collections::HashMap<ProviderKind, Arc<dyn LlmClient>> =
            std::collections::HashMap::new();
        clients.insert(ProviderKind::OpenAi, Arc::new(FixedClient { reply, fail }));
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
        let pdp = Arc::new(PolicyDecisionPoint::new(&SecurityConfig {
            max_requests_per_minute: rate_cap,
            ..Default::default()
        }));
        let audit = Arc::new(AuditLog::new(100));
        let registry = Arc::new(ToolRegistry::new(pdp.clone(), audit.clone()));
        let memory = Arc::new(MemoryCapture::new(Arc::new(NullEngine), None, SensitiveDetector::new()));
        let agent = AgentLoop::new(router, memory, registry, Arc::new(PromptRegistry::new()));
        ChannelRuntime::new(agent, Arc::new(ConversationCache::new(20)), pdp, audit)
    }

    #[tokio::test]
    async fn successful_turn_completes_envelope_and_buffers() {
        let rt = runtime("hello!", false, 30);
        let mut envelope = rt.receive(ChannelKind::Telegram, "42", "Kim", "hi", HashMap::new());
        let reply = rt.process(&mut envelope).await.unwrap();
        assert_eq!(reply, "hello!");
        assert_eq!(envelope.state, EnvelopeState::Completed);
        assert_eq!(envelope.response, "hello!");

        let history = rt.sessions().history("telegram", "42");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[1].content, "hello!");
    }

    #[tokio::test]
    async fn llm_exhaustion_fails_the_envelope() {
        let rt = runtime("", true, 30);
        let mut envelope = rt.receive(ChannelKind::Web, "u", "", "hi", HashMap::new());
        let err = rt.process(&mut envelope).await.unwrap_err();
        assert!(matches!(err, AdjutantError::Llm(_)));
        assert_eq!(envelope.state, EnvelopeState::Failed);
        assert!(!envelope.error.is_empty());
        assert!(rt.sessions().history("web", "u").is_empty());
    }

    #[tokio::test]
    async fn rate_limited_message_is_denied() {
        let rt = runtime("hello!", false, 1);
        let mut first = rt.receive(ChannelKind::Cli, "u", "", "one", HashMap::new());
        rt.process(&mut first).await.unwrap();

        let mut second = rt.receive(ChannelKind::Cli, "u", "", "two", HashMap::new());
        let err = rt.process(&mut second).await.unwrap_err();
        assert!(matches!(err, AdjutantError::Security(_)));
        assert_eq!(second.state, EnvelopeState::Denied);
        assert_eq!(second.error, "rate_limited");
    }
}

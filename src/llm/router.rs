//! Role-scoped model routing with provider fallback.

use crate::config::LlmConfig;
use crate::errors::AdjutantError;
use crate::llm::{ChatMessage, Completion, CompletionRequest, LlmClient, ResponseFormat, Role, StreamChunk};
use anyhow::Result;
use futures_util::stream::BoxStream;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Which external provider serves a model id. The id prefix decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Gemini,
    Anthropic,
}

impl ProviderKind {
    pub fn for_model(model: &str) -> Self {
        if model.starts_with("gemini/") {
            Self::Gemini
        } else if model.starts_with("anthropic/") || model.starts_with("claude") {
            Self::Anthropic
        } else {
            Self::OpenAi
        }
    }

    pub fn credential_env(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

/// Drop models whose provider credential is absent from the environment.
pub fn filter_by_credentials(models: &[String]) -> Vec<String> {
    models
        .iter()
        .filter(|m| {
            let key = ProviderKind::for_model(m).credential_env();
            std::env::var(key).is_ok_and(|v| !v.is_empty())
        })
        .cloned()
        .collect()
}

/// Routes completion calls across a fallback chain of models, optionally
/// scoped by role. Any per-model error advances to the next model; only
/// total exhaustion surfaces.
pub struct LlmRouter {
    clients: HashMap<ProviderKind, Arc<dyn LlmClient>>,
    fallback_models: Vec<String>,
    role_models: RwLock<HashMap<String, Vec<String>>>,
    temperature: f32,
    max_tokens: u32,
    timeout_secs: u64,
}

impl std::fmt::Debug for LlmRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmRouter")
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .field("fallback_models", &self.fallback_models)
            .field("role_models", &self.role_models)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl LlmRouter {
    pub fn new(config: &LlmConfig, clients: HashMap<ProviderKind, Arc<dyn LlmClient>>) -> Result<Self, AdjutantError> {
        let fallback_models: Vec<String> = config
            .models
            .iter()
            .filter(|m| clients.contains_key(&ProviderKind::for_model(m)))
            .cloned()
            .collect();
        if fallback_models.is_empty() {
            return Err(AdjutantError::Llm(
                "no usable LLM models; check provider credentials".to_string(),
            ));
        }
        info!(models = ?fallback_models, "LLM router initialized");
        let router = Self {
            clients,
            fallback_models,
            role_models: RwLock::new(HashMap::new()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout_secs: config.timeout,
        };
        if let Some(ref path) = config.role_models_file {
            if let Err(e) = router.load_role_models(path) {
                warn!(path = %path.display(), error = %e, "role model cache not loaded");
            }
        }
        Ok(router)
    }

    /// Replace the role→chain mapping at runtime.
    pub fn set_role_models(&self, mapping: HashMap<String, Vec<String>>) {
        let mut guard = self.role_models.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = mapping;
        info!("role model mapping updated");
    }

    /// Load a `role: [model, ...]` YAML map.
    pub fn load_role_models(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        let mapping: HashMap<String, Vec<String>> = serde_yaml_ng::from_str(&content)?;
        self.set_role_models(mapping);
        Ok(())
    }

    pub fn models_for(&self, role: Role) -> Vec<String> {
        let guard = self.role_models.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.get(role.as_str()).cloned().unwrap_or_default()
    }

    pub fn models(&self) -> Vec<String> {
        self.fallback_models.clone()
    }

    /// Explicit model wins, then the role chain, then the process chain.
    fn resolve(&self, model: Option<&str>, role: Option<Role>) -> Vec<String> {
        if let Some(m) = model {
            return vec![m.to_string()];
        }
        if let Some(r) = role {
            let chain = self.models_for(r);
            if !chain.is_empty() {
                return chain;
            }
        }
        self.fallback_models.clone()
    }

    fn client_for(&self, model: &str) -> Option<Arc<dyn LlmClient>> {
        self.clients.get(&ProviderKind::for_model(model)).cloned()
    }

    fn request(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<Value>>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
        response_format: Option<ResponseFormat>,
    ) -> CompletionRequest {
        CompletionRequest {
            messages,
            tools,
            temperature: temperature.unwrap_or(self.temperature),
            max_tokens: max_tokens.unwrap_or(self.max_tokens),
            timeout_secs: self.timeout_secs,
            response_format,
        }
    }

    /// One completion call through the fallback chain.
    pub async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<Value>>,
        model: Option<&str>,
        role: Option<Role>,
    ) -> Result<Completion, AdjutantError> {
        self.complete_with(messages, tools, model, role, None, None, None).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn complete_with(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<Value>>,
        model: Option<&str>,
        role: Option<Role>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
        response_format: Option<ResponseFormat>,
    ) -> Result<Completion, AdjutantError> {
        let chain = self.resolve(model, role);
        let mut last_error = None;
        for m in &chain {
            let Some(client) = self.client_for(m) else {
                last_error = Some(format!("no client for model {}", m));
                continue;
            };
            let req = self.request(messages.clone(), tools.clone(), temperature, max_tokens, response_format.clone());
            match client.complete(m, req).await {
                Ok(mut completion) => {
                    completion.model = m.clone();
                    debug!(model = %m, role = ?role.map(Role::as_str), "LLM call succeeded");
                    return Ok(completion);
                }
                Err(e) => {
                    warn!(model = %m, error = %e, "LLM call failed, trying next model");
                    last_error = Some(e.to_string());
                }
            }
        }
        Err(AdjutantError::Llm(format!(
            "all models failed ({}): {}",
            chain.join(", "),
            last_error.unwrap_or_default()
        )))
    }

    /// Single-prompt convenience wrapper returning the text content.
    pub async fn complete_text(
        &self,
        prompt: &str,
        system: &str,
        role: Option<Role>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<String, AdjutantError> {
        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));
        let completion = self
            .complete_with(messages, None, None, role, temperature, max_tokens, None)
            .await?;
        Ok(completion.content.unwrap_or_default())
    }

    /// Open a streaming call through the fallback chain. Failing to *open* a
    /// stream advances to the next model; errors after the first chunk
    /// surface to the consumer.
    pub async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<Value>>,
        model: Option<&str>,
        role: Option<Role>,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>, AdjutantError> {
        let chain = self.resolve(model, role);
        let mut last_error = None;
        for m in &chain {
            let Some(client) = self.client_for(m) else {
                last_error = Some(format!("no client for model {}", m));
                continue;
            };
            let req = self.request(messages.clone(), tools.clone(), None, None, None);
            match client.stream(m, req).await {
                Ok(stream) => {
                    debug!(model = %m, "LLM stream opened");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(model = %m, error = %e, "LLM stream failed to open, trying next model");
                    last_error = Some(e.to_string());
                }
            }
        }
        Err(AdjutantError::Llm(format!(
            "all streaming models failed ({}): {}",
            chain.join(", "),
            last_error.unwrap_or_default()
        )))
    }
}

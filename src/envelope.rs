use crate::errors::AdjutantError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Message source a turn arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Telegram,
    Slack,
    Discord,
    Web,
    Cli,
    Api,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Telegram => "telegram",
            Self::Slack => "slack",
            Self::Discord => "discord",
            Self::Web => "web",
            Self::Cli => "cli",
            Self::Api => "api",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle state of an envelope. Transitions are restricted to the graph
/// in [`Envelope::transition`]; anything else is a hard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeState {
    Created,
    Authorized,
    Denied,
    Processing,
    ToolCalling,
    Completed,
    Failed,
}

/// A memory snippet recalled for a turn. Produced by the external memory
/// engine and consumed read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnippet {
    pub content: String,
    pub score: f64,
    pub source: String,
}

/// The unit of work through the agent loop: one inbound user message with
/// its lifecycle state, recorded tool intents, and assembled response.
///
/// `id` is a UUIDv7, so envelopes sort by creation time. `id` and
/// `created_at` are immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub channel: ChannelKind,
    pub user_id: String,
    pub user_name: String,
    pub content: String,
    pub state: EnvelopeState,
    pub metadata: HashMap<String, String>,
    pub response: String,
    pub error: String,
    pub tool_calls: Vec<crate::tools::intent::ToolCallIntent>,
    pub memory_context: Vec<MemorySnippet>,
}

impl Envelope {
    pub fn new(channel: ChannelKind, user_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            channel,
            user_id: user_id.into(),
            user_name: String::new(),
            content: content.into(),
            state: EnvelopeState::Created,
            metadata: HashMap::new(),
            response: String::new(),
            error: String::new(),
            tool_calls: Vec::new(),
            memory_context: Vec::new(),
        }
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = name.into();
        self
    }

    /// Advance the envelope state. Invalid transitions fail loudly.
    pub fn transition(&mut self, next: EnvelopeState) -> Result<(), AdjutantError> {
        use EnvelopeState::*;
        let allowed: &[EnvelopeState] = match self.state {
            Created => &[Authorized, Denied],
            Authorized => &[Processing],
            Processing => &[ToolCalling, Completed, Failed],
            ToolCalling => &[Processing, Completed, Failed],
            Denied | Completed | Failed => &[],
        };
        if !allowed.contains(&next) {
            return Err(AdjutantError::Agent(format!(
                "invalid envelope transition: {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Memory bank this envelope's turn reads and writes.
    pub fn bank_id(&self) -> String {
        format!("{}-{}", self.channel, self.user_id)
    }
}

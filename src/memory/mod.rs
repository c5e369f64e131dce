//! Semantic memory capability contract and the capture adapter that guards
//! it with the secret vault.

pub mod capture;
pub mod markdown;
pub mod signal;

use crate::envelope::MemorySnippet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use capture::MemoryCapture;
pub use markdown::MarkdownMemoryEngine;
pub use signal::SensitiveDetector;

/// Default bank for agent conversations.
pub const DEFAULT_BANK: &str = "adjutant-default";
/// Bank recording created and deleted skills for the synthesizer.
pub const SKILL_BANK: &str = "adjutant-skills";

/// Separator the engine uses to join recalled snippets into one context
/// string.
pub const CONTEXT_SEPARATOR: &str = "\n---\n";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetainReceipt {
    pub status: String,
    pub bank_id: String,
    pub content_length: usize,
    #[serde(default)]
    pub facts_detected: usize,
    #[serde(default)]
    pub log_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallResult {
    /// Top matches joined with [`CONTEXT_SEPARATOR`].
    pub context: String,
    pub memories: Vec<MemorySnippet>,
    pub query: String,
    pub bank_id: String,
}

impl RecallResult {
    pub fn empty(query: &str, bank_id: &str) -> Self {
        Self {
            context: String::new(),
            memories: vec![],
            query: query.to_string(),
            bank_id: bank_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectReceipt {
    pub status: String,
    pub bank_id: String,
    pub indexed_files: usize,
}

/// The markdown-indexed semantic memory engine. External collaborator;
/// the core only sees this contract.
#[async_trait]
pub trait MemoryEngine: Send + Sync {
    async fn retain(&self, text: &str, context: &str, bank_id: &str) -> anyhow::Result<RetainReceipt>;

    async fn recall(&self, query: &str, bank_id: &str) -> anyhow::Result<RecallResult>;

    async fn reflect(&self, bank_id: &str) -> anyhow::Result<ReflectReceipt>;

    async fn health_check(&self) -> bool;
}

use thiserror::Error;

/// Typed error hierarchy for adjutant.
///
/// Used at module boundaries (router calls, tool dispatch, vault wire,
/// channel adapters). Leaf functions keep `anyhow::Result` — the `Internal`
/// variant converts via `?`.
#[derive(Debug, Error)]
pub enum AdjutantError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("memory engine error: {0}")]
    Memory(String),

    #[error("LLM call failed: {0}")]
    Llm(String),

    #[error("tool dispatch error: {0}")]
    ToolDispatch(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AdjutantError {
    /// Whether the failure is recoverable from inside a turn. Tool dispatch
    /// errors always are — they become `{error}` outcomes and re-enter the
    /// reason step. Everything else propagates to the loop boundary.
    pub fn is_turn_recoverable(&self) -> bool {
        matches!(self, Self::ToolDispatch(_) | Self::Memory(_))
    }
}

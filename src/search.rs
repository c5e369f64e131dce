//! Web search capability contract. Purely advisory — consumers absorb
//! every failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub body: String,
    pub href: String,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn text(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<SearchHit>>;
}

//! Per-user conversation buffers.
//!
//! Keyed by `(channel, user_id)`, bounded to `2 × max_turns` entries with
//! oldest-first eviction, and cleared wholesale whenever the tool catalog
//! changes (prior histories are no longer consistent with the new catalog).

use crate::llm::ChatMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

pub struct ConversationCache {
    max_turns: usize,
    buffers: Mutex<HashMap<(String, String), Vec<ChatMessage>>>,
}

impl ConversationCache {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns: max_turns.max(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    fn key(channel: &str, user_id: &str) -> (String, String) {
        (channel.to_string(), user_id.to_string())
    }

    pub fn history(&self, channel: &str, user_id: &str) -> Vec<ChatMessage> {
        let buffers = self.buffers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        buffers.get(&Self::key(channel, user_id)).cloned().unwrap_or_default()
    }

    /// Append one message, evicting the oldest entries past `2 × max_turns`.
    pub fn append(&self, channel: &str, user_id: &str, role: &str, content: &str) {
        let mut buffers = self.buffers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let buffer = buffers.entry(Self::key(channel, user_id)).or_default();
        buffer.push(ChatMessage {
            role: role.to_string(),
            content: content.to_string(),
            ..Default::default()
        });
        let cap = self.max_turns * 2;
        while buffer.len() > cap {
            buffer.remove(0);
        }
    }

    /// Record a completed user/assistant turn.
    pub fn append_turn(&self, channel: &str, user_id: &str, user_text: &str, assistant_text: &str) {
        self.append(channel, user_id, "user", user_text);
        self.append(channel, user_id, "assistant", assistant_text);
    }

    pub fn clear_all(&self) {
        let mut buffers = self.buffers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !buffers.is_empty() {
            info!(buffers = buffers.len(), "conversation cache cleared");
        }
        buffers.clear();
    }

    pub fn is_empty(&self) -> bool {
        let buffers = self.buffers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        buffers.values().all(Vec::is_empty)
    }

    /// Distinct user ids with buffered conversations on `channel`. Used by
    /// the notifier to reach recently active chats.
    pub fn user_ids_for_channel(&self, channel: &str) -> Vec<String> {
        let buffers = self.buffers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut ids: Vec<String> = buffers
            .keys()
            .filter(|(c, _)| c == channel)
            .map(|(_, u)| u.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Wire the cache to a tool registry so any catalog change clears every
    /// buffer before the next turn.
    pub fn subscribe_to(self: &Arc<Self>, registry: &crate::tools::ToolRegistry) {
        let cache = Arc::clone(self);
        registry.on_change(move |_event| cache.clear_all());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_per_user_and_channel() {
        let cache = ConversationCache::new(20);
        cache.append_turn("telegram", "u1", "hi", "hello");
        cache.append_turn("telegram", "u2", "yo", "hey");
        assert_eq!(cache.history("telegram", "u1").len(), 2);
        assert_eq!(cache.history("telegram", "u2").len(), 2);
        assert!(cache.history("web", "u1").is_empty());
    }

    #[test]
    fn eviction_drops_oldest_first() {
        let cache = ConversationCache::new(2); // capacity 4 entries
        for i in 0..4 {
            cache.append_turn("cli", "u", &format!("q{}", i), &format!("a{}", i));
        }
        let history = cache.history("cli", "u");
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "q2");
        assert_eq!(history[3].content, "a3");
    }

    #[test]
    fn registry_change_clears_everything() {
        use crate::config::SecurityConfig;
        use crate::security::{AuditLog, PolicyDecisionPoint};
        use crate::tools::{ToolDescriptor, ToolOrigin, ToolRegistry, echo_invoker};

        let registry = ToolRegistry::new(
            Arc::new(PolicyDecisionPoint::new(&SecurityConfig::default())),
            Arc::new(AuditLog::new(10)),
        );
        let cache = Arc::new(ConversationCache::new(20));
        cache.subscribe_to(&registry);

        cache.append_turn("web", "u", "hi", "hello");
        assert!(!cache.is_empty());

        registry
            .register(ToolDescriptor::new(
                "echo2",
                "",
                serde_json::json!({}),
                ToolOrigin::Dynamic,
                echo_invoker(),
            ))
            .unwrap();
        assert!(cache.is_empty(), "catalog change must clear all buffers");
    }

    #[test]
    fn channel_user_listing() {
        let cache = ConversationCache::new(20);
        cache.append_turn("telegram", "7", "a", "b");
        cache.append_turn("telegram", "3", "a", "b");
        cache.append_turn("web", "x", "a", "b");
        assert_eq!(cache.user_ids_for_channel("telegram"), vec!["3", "7"]);
    }
}

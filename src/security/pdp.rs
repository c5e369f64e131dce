use crate::config::SecurityConfig;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const RATE_WINDOW: Duration = Duration::from_secs(60);

struct PolicyInner {
    allowed: HashSet<String>,
    blocked: HashSet<String>,
    max_per_minute: usize,
    /// Per-user timestamps of recent allowed calls, oldest first.
    windows: HashMap<String, VecDeque<Instant>>,
}

/// Policy decision point for tool dispatch.
///
/// Deny-list wins over allow-list; an empty allow-list admits every tool not
/// explicitly denied. A per-user sliding 60-second window caps call volume.
pub struct PolicyDecisionPoint {
    inner: Mutex<PolicyInner>,
}

impl PolicyDecisionPoint {
    pub fn new(config: &SecurityConfig) -> Self {
        info!(
            allowed = config.allowed_tools.len(),
            blocked = config.blocked_tools.len(),
            rate_limit = config.max_requests_per_minute,
            "policy decision point initialized"
        );
        Self {
            inner: Mutex::new(PolicyInner {
                allowed: config.allowed_tools.iter().cloned().collect(),
                blocked: config.blocked_tools.iter().cloned().collect(),
                max_per_minute: config.max_requests_per_minute,
                windows: HashMap::new(),
            }),
        }
    }

    /// Decide whether `tool` may run for `user` on `channel` right now.
    /// Returns `(allowed, reason)`.
    pub fn check(&self, tool: &str, user_id: &str, channel: &str) -> (bool, String) {
        self.check_at(tool, user_id, channel, Instant::now())
    }

    /// Same as [`check`](Self::check) with an injectable clock instant.
    pub fn check_at(&self, tool: &str, user_id: &str, channel: &str, now: Instant) -> (bool, String) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        if inner.blocked.contains(tool) {
            warn!(tool, user_id, channel, "tool blocked by deny-list");
            return (false, format!("blocked:{}", tool));
        }

        if !inner.allowed.is_empty() && !inner.allowed.contains(tool) {
            warn!(tool, user_id, channel, "tool not on allow-list");
            return (false, format!("not_allowed:{}", tool));
        }

        let cap = inner.max_per_minute;
        let key = if user_id.is_empty() { "anonymous" } else { user_id };
        let window = inner.windows.entry(key.to_string()).or_default();
        while window.front().is_some_and(|t| now.duration_since(*t) >= RATE_WINDOW) {
            window.pop_front();
        }
        if window.len() >= cap {
            warn!(user_id = key, "tool call rate limited");
            return (false, "rate_limited".to_string());
        }
        window.push_back(now);

        (true, "ok".to_string())
    }

    /// Add a tool to the deny-list. Effective for the next check.
    pub fn add_blocked(&self, tool: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.blocked.insert(tool.to_string()) {
            info!(tool, "tool added to deny-list");
        }
    }

    /// Remove a tool from the deny-list.
    pub fn remove_blocked(&self, tool: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.blocked.remove(tool) {
            info!(tool, "tool removed from deny-list");
        }
    }

    /// Current policy snapshot for the REST surface.
    pub fn summary(&self) -> Value {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut allowed: Vec<&String> = inner.allowed.iter().collect();
        let mut blocked: Vec<&String> = inner.blocked.iter().collect();
        allowed.sort();
        blocked.sort();
        json!({
            "allowed_tools": allowed,
            "blocked_tools": blocked,
            "max_requests_per_minute": inner.max_per_minute,
        })
    }
}

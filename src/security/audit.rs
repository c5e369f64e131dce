use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{info, warn};

/// One audit entry. Never mutated after append.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub allowed: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
    /// Monotonic seconds since the log was created.
    pub timestamp: f64,
}

struct AuditInner {
    entries: VecDeque<AuditRecord>,
    max_entries: usize,
}

/// Append-only in-memory audit ring. Oldest entries drop past capacity.
pub struct AuditLog {
    inner: Mutex<AuditInner>,
    epoch: Instant,
}

impl AuditLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(AuditInner {
                entries: VecDeque::with_capacity(max_entries.min(1024)),
                max_entries: max_entries.max(1),
            }),
            epoch: Instant::now(),
        }
    }

    pub fn log_tool_call(
        &self,
        tool: &str,
        user_id: &str,
        channel: &str,
        allowed: bool,
        reason: &str,
        details: HashMap<String, Value>,
    ) {
        if allowed {
            info!(tool, user_id, channel, "tool call allowed");
        } else {
            warn!(tool, user_id, reason, "tool call denied");
        }
        self.append(AuditRecord {
            event: "tool_call".to_string(),
            tool: Some(tool.to_string()),
            user_id: (!user_id.is_empty()).then(|| user_id.to_string()),
            channel: (!channel.is_empty()).then(|| channel.to_string()),
            allowed,
            reason: reason.to_string(),
            details,
            timestamp: self.epoch.elapsed().as_secs_f64(),
        });
    }

    pub fn log_security_event(&self, event: &str, user_id: &str, details: HashMap<String, Value>) {
        info!(event, user_id, "security event");
        self.append(AuditRecord {
            event: event.to_string(),
            tool: None,
            user_id: (!user_id.is_empty()).then(|| user_id.to_string()),
            channel: None,
            allowed: true,
            reason: String::new(),
            details,
            timestamp: self.epoch.elapsed().as_secs_f64(),
        });
    }

    fn append(&self, record: AuditRecord) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.entries.len() == inner.max_entries {
            inner.entries.pop_front();
        }
        inner.entries.push_back(record);
    }

    /// Last `count` entries, oldest first.
    pub fn recent(&self, count: usize) -> Vec<AuditRecord> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let skip = inner.entries.len().saturating_sub(count);
        inner.entries.iter().skip(skip).cloned().collect()
    }

    pub fn by_user(&self, user_id: &str) -> Vec<AuditRecord> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .entries
            .iter()
            .filter(|e| e.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect()
    }

    pub fn denied(&self) -> Vec<AuditRecord> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .entries
            .iter()
            .filter(|e| e.event == "tool_call" && !e.allowed)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_oldest() {
        let log = AuditLog::new(3);
        for i in 0..5 {
            log.log_tool_call(&format!("t{}", i), "u", "cli", true, "ok", HashMap::new());
        }
        assert_eq!(log.len(), 3);
        let recent = log.recent(10);
        assert_eq!(recent[0].tool.as_deref(), Some("t2"));
        assert_eq!(recent[2].tool.as_deref(), Some("t4"));
    }

    #[test]
    fn recent_returns_tail() {
        let log = AuditLog::new(100);
        for i in 0..10 {
            log.log_tool_call(&format!("t{}", i), "u", "cli", true, "ok", HashMap::new());
        }
        let last_two = log.recent(2);
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[1].tool.as_deref(), Some("t9"));
    }

    #[test]
    fn denied_filter_only_matches_tool_calls() {
        let log = AuditLog::new(100);
        log.log_tool_call("a", "u1", "cli", false, "blocked:a", HashMap::new());
        log.log_tool_call("b", "u1", "cli", true, "ok", HashMap::new());
        log.log_security_event("message_denied", "u1", HashMap::new());
        let denied = log.denied();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].tool.as_deref(), Some("a"));
    }

    #[test]
    fn by_user_filters() {
        let log = AuditLog::new(100);
        log.log_tool_call("a", "u1", "cli", true, "ok", HashMap::new());
        log.log_tool_call("b", "u2", "cli", true, "ok", HashMap::new());
        assert_eq!(log.by_user("u2").len(), 1);
        assert!(log.by_user("nobody").is_empty());
    }

    #[test]
    fn timestamps_are_monotonic() {
        let log = AuditLog::new(10);
        log.log_tool_call("a", "u", "cli", true, "ok", HashMap::new());
        log.log_tool_call("b", "u", "cli", true, "ok", HashMap::new());
        let entries = log.recent(2);
        assert!(entries[0].timestamp <= entries[1].timestamp);
    }
}

//! Unified tool catalog and the policy-gated dispatch path.

use crate::security::{AuditLog, PolicyDecisionPoint};
use crate::tools::intent::{ToolCallIntent, ToolOutcome};
use crate::tools::{ToolDescriptor, is_valid_tool_name};
use anyhow::Result;
use indexmap::IndexMap;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Catalog change notifications delivered to registered hooks before the
/// next turn starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(String),
    Removed(String),
    Toggled(String, bool),
}

type ChangeHook = Box<dyn Fn(&RegistryEvent) + Send + Sync>;

/// Owns `name → descriptor` and every dispatch. Readers take snapshots;
/// mutation happens under one lock.
pub struct ToolRegistry {
    tools: RwLock<IndexMap<String, ToolDescriptor>>,
    hooks: RwLock<Vec<ChangeHook>>,
    pdp: Arc<PolicyDecisionPoint>,
    audit: Arc<AuditLog>,
    dispatch_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(pdp: Arc<PolicyDecisionPoint>, audit: Arc<AuditLog>) -> Self {
        Self {
            tools: RwLock::new(IndexMap::new()),
            hooks: RwLock::new(Vec::new()),
            pdp,
            audit,
            dispatch_timeout: DISPATCH_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn pdp(&self) -> Arc<PolicyDecisionPoint> {
        self.pdp.clone()
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        self.audit.clone()
    }

    /// Insert a descriptor. Invalid or duplicate names reject and leave the
    /// catalog untouched.
    pub fn register(&self, descriptor: ToolDescriptor) -> Result<()> {
        if !is_valid_tool_name(&descriptor.name) {
            anyhow::bail!("invalid tool name: {:?}", descriptor.name);
        }
        let name = descriptor.name.clone();
        {
            let mut tools = self.tools.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            if tools.contains_key(&name) {
                anyhow::bail!("duplicate tool name: {}", name);
            }
            tools.insert(name.clone(), descriptor);
        }
        info!(tool = %name, "tool registered");
        self.emit(&RegistryEvent::Added(name));
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = {
            let mut tools = self.tools.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            tools.shift_remove(name).is_some()
        };
        if removed {
            info!(tool = name, "tool removed");
            self.emit(&RegistryEvent::Removed(name.to_string()));
        }
        removed
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let changed = {
            let mut tools = self.tools.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            match tools.get_mut(name) {
                Some(d) if d.enabled != enabled => {
                    d.enabled = enabled;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit(&RegistryEvent::Toggled(name.to_string(), enabled));
        }
        changed
    }

    pub fn contains(&self, name: &str) -> bool {
        let tools = self.tools.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        tools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<ToolDescriptor> {
        let tools = self.tools.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        tools.get(name).cloned()
    }

    /// Sorted names of every registered tool (enabled or not).
    pub fn names(&self) -> Vec<String> {
        let tools = self.tools.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut names: Vec<String> = tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// The catalog published to the LLM: enabled tools only, OpenAI shape,
    /// sorted by name.
    pub fn openai_definitions(&self) -> Vec<Value> {
        let tools = self.tools.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut defs: Vec<(String, Value)> = tools
            .values()
            .filter(|d| d.enabled)
            .map(|d| (d.name.clone(), d.openai_definition()))
            .collect();
        defs.sort_by(|a, b| a.0.cmp(&b.0));
        defs.into_iter().map(|(_, def)| def).collect()
    }

    /// Subscribe to catalog changes.
    pub fn on_change(&self, hook: impl Fn(&RegistryEvent) + Send + Sync + 'static) {
        let mut hooks = self.hooks.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        hooks.push(Box::new(hook));
    }

    fn emit(&self, event: &RegistryEvent) {
        let hooks = self.hooks.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        for hook in hooks.iter() {
            hook(event);
        }
    }

    /// Policy-checked, audited execution of one intent. Never errors from
    /// the caller's perspective: denials, timeouts, panics and invoker
    /// failures all come back as `{"error": ...}` outcomes.
    pub async fn dispatch(&self, intent: &ToolCallIntent, user_id: &str, channel: &str) -> ToolOutcome {
        let (allowed, reason) = self.pdp.check(&intent.name, user_id, channel);
        let mut details = HashMap::new();
        if let Value::Object(ref args) = intent.arguments {
            details.insert(
                "args_keys".to_string(),
                json!(args.keys().collect::<Vec<_>>()),
            );
        }
        self.audit
            .log_tool_call(&intent.name, user_id, channel, allowed, &reason, details);

        if !allowed {
            return ToolOutcome::new(&intent.call_id, &json!({"error": reason}));
        }

        let Some(descriptor) = self.get(&intent.name).filter(|d| d.enabled) else {
            return ToolOutcome::new(
                &intent.call_id,
                &json!({"error": format!("unknown tool: {}", intent.name)}),
            );
        };

        let invoker = descriptor.invoker.clone();
        let arguments = intent.arguments.clone();
        let timeout = self.dispatch_timeout;
        let name = intent.name.clone();

        // The invoker runs in its own task so a panic cannot take down the
        // turn.
        let handle =
            tokio::spawn(async move { tokio::time::timeout(timeout, invoker.invoke(arguments)).await });

        let result = match handle.await {
            Ok(Ok(Ok(value))) => value,
            Ok(Ok(Err(e))) => {
                warn!(tool = %name, error = %e, "tool invoker failed");
                json!({"error": e.to_string()})
            }
            Ok(Err(_)) => {
                warn!(tool = %name, timeout_secs = timeout.as_secs(), "tool timed out");
                json!({"error": format!("tool '{}' timed out after {}s", name, timeout.as_secs())})
            }
            Err(join_err) => {
                error!(tool = %name, error = %join_err, "tool task panicked");
                json!({"error": format!("tool '{}' crashed", name)})
            }
        };

        ToolOutcome::new(&intent.call_id, &result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::tools::{FnInvoker, ToolOrigin, echo_invoker};
    use futures_util::future::BoxFuture;

    fn registry(blocked: &[&str]) -> ToolRegistry {
        let pdp = Arc::new(PolicyDecisionPoint::new(&SecurityConfig {
            blocked_tools: blocked.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }));
        let audit = Arc::new(AuditLog::new(100));
        ToolRegistry::new(pdp, audit)
    }

    fn echo_descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor::new(
            name,
            "echo",
            json!({"type": "object", "properties": {"m": {"type": "string"}}}),
            ToolOrigin::Builtin,
            echo_invoker(),
        )
    }

    #[test]
    fn duplicate_names_reject() {
        let r = registry(&[]);
        r.register(echo_descriptor("echo")).unwrap();
        assert!(r.register(echo_descriptor("echo")).is_err());
        assert_eq!(r.names(), vec!["echo"]);
    }

    #[test]
    fn invalid_names_reject() {
        let r = registry(&[]);
        assert!(r.register(echo_descriptor("bad-name")).is_err());
        assert!(r.names().is_empty());
    }

    #[test]
    fn change_events_fire() {
        let r = registry(&[]);
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = events.clone();
        r.on_change(move |e| sink.lock().unwrap().push(e.clone()));

        r.register(echo_descriptor("echo")).unwrap();
        r.set_enabled("echo", false);
        r.remove("echo");

        let seen = events.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                RegistryEvent::Added("echo".into()),
                RegistryEvent::Toggled("echo".into(), false),
                RegistryEvent::Removed("echo".into()),
            ]
        );
    }

    #[test]
    fn disabled_tools_leave_catalog() {
        let r = registry(&[]);
        r.register(echo_descriptor("echo")).unwrap();
        assert_eq!(r.openai_definitions().len(), 1);
        r.set_enabled("echo", false);
        assert!(r.openai_definitions().is_empty());
        // still present by name, just not published
        assert!(r.contains("echo"));
    }

    #[tokio::test]
    async fn dispatch_happy_path() {
        let r = registry(&[]);
        r.register(echo_descriptor("echo")).unwrap();
        let intent = ToolCallIntent::new("c1", "echo", json!({"m": "x"}));
        let outcome = r.dispatch(&intent, "u1", "cli").await;
        assert_eq!(outcome.call_id, "c1");
        let value: Value = serde_json::from_str(&outcome.content).unwrap();
        assert_eq!(value["echoed"]["m"], "x");
        assert_eq!(r.audit().recent(1)[0].allowed, true);
    }

    #[tokio::test]
    async fn denied_dispatch_skips_invoker_and_audits() {
        let r = registry(&["shell_exec"]);
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = called.clone();
        let invoker = Arc::new(FnInvoker(move |_: Value| -> BoxFuture<'static, Result<Value>> {
            let flag = flag.clone();
            Box::pin(async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(json!({}))
            })
        }));
        r.register(ToolDescriptor::new(
            "shell_exec",
            "run shell",
            json!({}),
            ToolOrigin::Builtin,
            invoker,
        ))
        .unwrap();

        let intent = ToolCallIntent::new("c1", "shell_exec", json!({"cmd": "rm"}));
        let outcome = r.dispatch(&intent, "u1", "cli").await;
        let value: Value = serde_json::from_str(&outcome.content).unwrap();
        assert_eq!(value, json!({"error": "blocked:shell_exec"}));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));

        let denied = r.audit().denied();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].reason, "blocked:shell_exec");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_outcome() {
        let r = registry(&[]);
        let intent = ToolCallIntent::new("c1", "ghost", json!({}));
        let outcome = r.dispatch(&intent, "u", "cli").await;
        let value: Value = serde_json::from_str(&outcome.content).unwrap();
        assert!(value["error"].as_str().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn invoker_error_becomes_error_outcome() {
        let r = registry(&[]);
        let invoker = Arc::new(FnInvoker(|_: Value| -> BoxFuture<'static, Result<Value>> {
            Box::pin(async { anyhow::bail!("upstream exploded") })
        }));
        r.register(ToolDescriptor::new("boom", "", json!({}), ToolOrigin::Builtin, invoker))
            .unwrap();
        let outcome = r.dispatch(&ToolCallIntent::new("c1", "boom", json!({})), "u", "cli").await;
        let value: Value = serde_json::from_str(&outcome.content).unwrap();
        assert_eq!(value["error"], "upstream exploded");
    }

    #[tokio::test]
    async fn slow_invoker_times_out() {
        let r = registry(&[]).with_timeout(Duration::from_millis(50));
        let invoker = Arc::new(FnInvoker(|_: Value| -> BoxFuture<'static, Result<Value>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!({}))
            })
        }));
        r.register(ToolDescriptor::new("slow", "", json!({}), ToolOrigin::Builtin, invoker))
            .unwrap();
        let outcome = r.dispatch(&ToolCallIntent::new("c1", "slow", json!({})), "u", "cli").await;
        let value: Value = serde_json::from_str(&outcome.content).unwrap();
        assert!(value["error"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn ok_false_results_pass_through() {
        let r = registry(&[]);
        let invoker = Arc::new(FnInvoker(|_: Value| -> BoxFuture<'static, Result<Value>> {
            Box::pin(async { Ok(json!({"ok": false, "error": "domain-level miss"})) })
        }));
        r.register(ToolDescriptor::new("finder", "", json!({}), ToolOrigin::Builtin, invoker))
            .unwrap();
        let outcome = r.dispatch(&ToolCallIntent::new("c1", "finder", json!({})), "u", "cli").await;
        let value: Value = serde_json::from_str(&outcome.content).unwrap();
        // a domain-level negative is a successful execution, not a failure
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"], "domain-level miss");
        assert!(r.audit().denied().is_empty());
    }
}

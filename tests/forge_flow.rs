//! Skill synthesis end-to-end: background generation, hot-load, catalog
//! change effects, and broadcast notifications.

mod common;

use adjutant::config::SecurityConfig;
use adjutant::forge::{BundleLoader, ForgeCoordinator, PythonRuntime, SkillForge, SkillTester};
use adjutant::memory::signal::SensitiveDetector;
use adjutant::memory::{MarkdownMemoryEngine, MemoryCapture};
use adjutant::notify::{NotificationHub, NotificationSink};
use adjutant::security::{AuditLog, PolicyDecisionPoint};
use adjutant::session::ConversationCache;
use adjutant::tools::ToolRegistry;
use adjutant::tools::intent::ToolCallIntent;
use async_trait::async_trait;
use common::{Reply, ScriptedLlm, router_with};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RecordingSink {
    seen: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn label(&self) -> String {
        "recording".into()
    }

    async fn deliver(&self, event: &str, message: &str) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push((event.to_string(), message.to_string()));
        Ok(())
    }
}

struct Stack {
    coordinator: Arc<ForgeCoordinator>,
    registry: Arc<ToolRegistry>,
    sessions: Arc<ConversationCache>,
    notifications: Arc<Mutex<Vec<(String, String)>>>,
    tmp: tempfile::TempDir,
}

async fn stack(llm: Arc<ScriptedLlm>) -> Option<Stack> {
    let tmp = tempfile::tempdir().unwrap();
    let python = PythonRuntime::new("python3", tmp.path(), None).unwrap();
    if !python.is_available() {
        eprintln!("python3 unavailable; skipping");
        return None;
    }

    let router = router_with(llm);
    let engine = Arc::new(
        MarkdownMemoryEngine::new(tmp.path().join("memory"), SensitiveDetector::new()).unwrap(),
    );
    let memory = Arc::new(MemoryCapture::new(engine, None, SensitiveDetector::new()));
    let registry = Arc::new(ToolRegistry::new(
        Arc::new(PolicyDecisionPoint::new(&SecurityConfig::default())),
        Arc::new(AuditLog::new(100)),
    ));

    let sessions = Arc::new(ConversationCache::new(20));
    sessions.subscribe_to(&registry);

    let forge = Arc::new(SkillForge::new(
        router,
        memory,
        None,
        BundleLoader::new(python.clone()),
        SkillTester::new(python),
        tmp.path().join("tools/generated"),
        3,
    ));
    let notifications = Arc::new(Mutex::new(vec![]));
    let notifier = Arc::new(NotificationHub::new());
    notifier
        .subscribe(Arc::new(RecordingSink {
            seen: notifications.clone(),
        }))
        .await;
    let coordinator = Arc::new(ForgeCoordinator::new(
        forge,
        registry.clone(),
        notifier,
        tmp.path().join("tools"),
    ));

    Some(Stack {
        coordinator,
        registry,
        sessions,
        notifications,
        tmp,
    })
}

async fn wait_until_idle(coordinator: &ForgeCoordinator) {
    for _ in 0..600 {
        if !coordinator.is_generating() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("skill generation did not finish");
}

const ECHO2_CODE: &str = "from adjutant_skill import tool\n\n\n@tool(name=\"echo2\", description=\"Echo a message\")\nasync def echo2(m: str) -> dict:\n    return {\"echoed\": m}\n";

fn echo2_draft() -> Reply {
    Reply::Text(
        json!({
            "tool_name": "echo2",
            "description": "Echo a message",
            "tags": ["util"],
            "env_required": [],
            "code": ECHO2_CODE,
        })
        .to_string(),
    )
}

fn cases_reply() -> Reply {
    Reply::Text(json!([{"description": "happy", "kwargs": {"m": "x"}, "expect_error": false}]).to_string())
}

#[tokio::test]
async fn happy_path_hot_loads_and_notifies() {
    let llm = Arc::new(ScriptedLlm::new(vec![echo2_draft(), cases_reply()], vec![]));
    let Some(stack) = stack(llm).await else { return };

    // something is buffered before the catalog changes
    stack.sessions.append_turn("web", "u", "hi", "hello");
    assert!(!stack.sessions.is_empty());

    let status = stack.coordinator.request_skill("echo 도구 만들어줘".into());
    assert_eq!(status["status"], "generating");

    // a second request while one is in flight is rejected at the dispatch
    // site
    let second = stack.coordinator.request_skill("another".into());
    assert_eq!(second["status"], "already_generating");

    wait_until_idle(&stack.coordinator).await;

    // bundle on disk
    let bundle = stack.tmp.path().join("tools/generated/echo2");
    assert!(bundle.join("tool.py").exists());
    assert!(bundle.join("tool.yaml").exists());

    // registry lists it and dispatch works
    assert!(stack.registry.names().contains(&"echo2".to_string()));
    let outcome = stack
        .registry
        .dispatch(&ToolCallIntent::new("c1", "echo2", json!({"m": "x"})), "u", "web")
        .await;
    let value: serde_json::Value = serde_json::from_str(&outcome.content).unwrap();
    assert_eq!(value, json!({"echoed": "x"}));

    // buffers cleared by the catalog change, readiness broadcast delivered
    assert!(stack.sessions.is_empty());
    let seen = stack.notifications.lock().unwrap();
    assert!(
        seen.iter().any(|(event, msg)| event == "skill_created" && msg.contains("'echo2' is ready")),
        "{:?}",
        seen
    );
    assert!(!stack.coordinator.is_generating());
}

#[tokio::test]
async fn exhausted_retries_commit_nothing_and_notify_failure() {
    // attempt 1: forbidden pattern; attempt 2: invalid JSON; attempt 3:
    // runtime probe raises
    let bad_pattern = Reply::Text(
        json!({
            "tool_name": "runner",
            "description": "", "tags": [], "env_required": [],
            "code": "import subprocess\n\nasync def runner() -> None:\n    subprocess.run([\"ls\"])\n",
        })
        .to_string(),
    );
    let invalid_json = Reply::Text("{not json".into());
    let raising = Reply::Text(
        json!({
            "tool_name": "broken_probe",
            "description": "", "tags": [], "env_required": [],
            "code": "from adjutant_skill import tool\n\n\n@tool(name=\"broken_probe\", description=\"x\")\nasync def broken_probe(m: str) -> dict:\n    raise ValueError(\"always\")\n",
        })
        .to_string(),
    );
    let llm = Arc::new(ScriptedLlm::new(vec![bad_pattern, invalid_json, raising, cases_reply()], vec![]));
    let Some(stack) = stack(llm).await else { return };

    stack.coordinator.request_skill("weird tool".into());
    wait_until_idle(&stack.coordinator).await;

    assert!(!stack.tmp.path().join("tools/generated/runner").exists());
    assert!(!stack.tmp.path().join("tools/generated/broken_probe").exists());
    assert!(!stack.registry.names().iter().any(|n| n == "runner" || n == "broken_probe"));

    let seen = stack.notifications.lock().unwrap();
    assert!(
        seen.iter().any(|(event, msg)| event == "skill_failed" && msg.contains("weird tool")),
        "{:?}",
        seen
    );
    assert!(!stack.coordinator.is_generating());
}

#[tokio::test]
async fn deleted_skill_is_removed_and_remembered() {
    let llm = Arc::new(ScriptedLlm::new(vec![echo2_draft(), cases_reply()], vec![]));
    let Some(stack) = stack(llm).await else { return };

    stack.coordinator.request_skill("echo tool".into());
    wait_until_idle(&stack.coordinator).await;
    assert!(stack.registry.names().contains(&"echo2".to_string()));

    let result = stack.coordinator.delete_skill("echo2").await.unwrap();
    assert_eq!(result["status"], "deleted");
    assert!(!stack.tmp.path().join("tools/generated/echo2").exists());
    assert!(!stack.registry.names().contains(&"echo2".to_string()));

    // the deletion record lands in the skill bank for future drafts
    let listing = stack.coordinator.list_skills();
    assert_eq!(listing["total"], 0);
}

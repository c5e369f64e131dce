use super::*;
use crate::agent::AgentLoop;
use crate::config::{LlmConfig, SecurityConfig};
use crate::forge::{BundleLoader, SkillForge, SkillTester};
use crate::llm::prompts::PromptRegistry;
use crate::llm::router::ProviderKind;
use crate::llm::{Completion, CompletionRequest, LlmClient, LlmRouter, StreamChunk};
use crate::memory::signal::SensitiveDetector;
use crate::memory::{MemoryCapture, MemoryEngine, RecallResult, ReflectReceipt, RetainReceipt};
use crate::security::{AuditLog, PolicyDecisionPoint};
use crate::session::ConversationCache;
use crate::tools::ToolRegistry;
use axum::body::Body;
use axum::http::Request;
use futures_util::stream::BoxStream;
use tower::ServiceExt;

struct FixedClient;

#[async_trait]
impl LlmClient for FixedClient {
    async fn complete(&self, model: &str, _request: CompletionRequest) -> Result<Completion> {
        Ok(Completion {
            content: Some("fixed reply".to_string()),
            tool_calls: vec![],
            model: model.to_string(),
        })
    }

    async fn stream(
        &self,
        _model: &str,
        _request: CompletionRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        anyhow::bail!("not used")
    }
}

struct NullEngine;

#[async_trait]
impl MemoryEngine for NullEngine {
    async fn retain(&self, text: &str, _c: &str, bank_id: &str) -> Result<RetainReceipt> {
        Ok(RetainReceipt {
            status: "ok".into(),
            bank_id: bank_id.into(),
            content_length: text.len(),
            facts_detected: 0,
            log_path: None,
        })
    }

    async fn recall(&self, query: &str, bank_id: &str) -> Result<RecallResult> {
        Ok(RecallResult::empty(query, bank_id))
    }

    async fn reflect(&self, bank_id: &str) -> Result<ReflectReceipt> {
        Ok(ReflectReceipt {
            status: "ok".into(),
            bank_id: bank_id.into(),
            indexed_files: 0,
        })
    }

    async fn health_check(&self) -> bool {
        true
    }
}

fn state(tmp: &std::path::Path) -> GatewayState {
    let mut clients: HashMap<ProviderKind, Arc<dyn LlmClient>> = HashMap::new();
    clients.insert(ProviderKind::OpenAi, Arc::new(FixedClient));
    let router = Arc::new(
        LlmRouter::new(
            &LlmConfig {
                models: vec!["gpt-5-mini".into()],
                ..Default::default()
            },
            clients,
        )
        .unwrap(),
    );
    let pdp = Arc::new(PolicyDecisionPoint::new(&SecurityConfig::default()));
    let audit = Arc::new(AuditLog::new(100));
    let registry = Arc::new(ToolRegistry::new(pdp.clone(), audit.clone()));
    let memory = Arc::new(MemoryCapture::new(Arc::new(NullEngine), None, SensitiveDetector::new()));
    let agent = AgentLoop::new(router.clone(), memory.clone(), registry.clone(), Arc::new(PromptRegistry::new()));
    let runtime = Arc::new(ChannelRuntime::new(
        agent,
        Arc::new(ConversationCache::new(20)),
        pdp,
        audit,
    ));

    let python = crate::forge::python::test_runtime(tmp);
    let forge = Arc::new(SkillForge::new(
        router,
        memory,
        None,
        BundleLoader::new(python.clone()),
        SkillTester::new(python),
        tmp.join("tools/generated"),
        3,
    ));
    let notifier = Arc::new(NotificationHub::new());
    let coordinator = Arc::new(ForgeCoordinator::new(
        forge,
        registry,
        notifier.clone(),
        tmp.join("tools"),
    ));

    GatewayState {
        runtime,
        coordinator,
        notifier,
        vault: None,
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn status_reports_version_and_vault() {
    let tmp = tempfile::tempdir().unwrap();
    let router = build_router(state(tmp.path()));
    let response = router
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["vault"], "disabled");
    assert_eq!(body["skill_generating"], false);
}

#[tokio::test]
async fn policy_endpoint_exposes_snapshot() {
    let tmp = tempfile::tempdir().unwrap();
    let router = build_router(state(tmp.path()));
    let response = router
        .oneshot(Request::builder().uri("/policy").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert!(body["allowed_tools"].is_array());
    assert_eq!(body["max_requests_per_minute"], 30);
}

#[tokio::test]
async fn audit_endpoints_filter_and_limit() {
    let tmp = tempfile::tempdir().unwrap();
    let gateway_state = state(tmp.path());
    let audit = gateway_state.runtime.agent().registry().audit();
    audit.log_tool_call("a", "u1", "cli", true, "ok", HashMap::new());
    audit.log_tool_call("b", "u1", "cli", false, "blocked:b", HashMap::new());
    audit.log_tool_call("c", "u1", "cli", true, "ok", HashMap::new());

    let router = build_router(gateway_state.clone());
    let response = router
        .oneshot(Request::builder().uri("/audit?limit=2").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 2);

    let router = build_router(gateway_state);
    let response = router
        .oneshot(Request::builder().uri("/audit/denied").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["entries"][0]["tool"], "b");
}

#[tokio::test]
async fn chat_endpoint_runs_blocking_turn() {
    let tmp = tempfile::tempdir().unwrap();
    let router = build_router(state(tmp.path()));
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"message": "hi", "user_id": "tester"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["response"], "fixed reply");
    assert_eq!(body["bank_id"], "api-tester");
}

#[tokio::test]
async fn skills_listing_and_missing_delete() {
    let tmp = tempfile::tempdir().unwrap();
    let gateway_state = state(tmp.path());

    let router = build_router(gateway_state.clone());
    let response = router
        .oneshot(Request::builder().uri("/skills").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["total"], 0);

    let router = build_router(gateway_state);
    let response = router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/skills/ghost")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn vault_status_endpoint_without_vault() {
    let tmp = tempfile::tempdir().unwrap();
    let router = build_router(state(tmp.path()));
    let response = router
        .oneshot(Request::builder().uri("/vault/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "disabled");
}

//! The skill synthesizer: reference gathering → draft → check → load →
//! runtime probe, with error-fed retries.

use crate::forge::loader::{BundleLoader, BundleMeta};
use crate::forge::python::ProbedTool;
use crate::forge::tester::SkillTester;
use crate::llm::{ChatMessage, LlmRouter, ResponseFormat, Role};
use crate::memory::{MemoryCapture, SKILL_BANK};
use crate::search::WebSearch;
use crate::tools::is_valid_tool_name;
use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const PAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const PAGE_TEXT_LIMIT: usize = 3000;
const SNIPPET_LIMIT: usize = 8;
const CRAWL_LIMIT: usize = 2;
const CODE_EXCERPT_LIMIT: usize = 1000;

/// Hosts likely to carry real code or API docs, crawled first.
const CONTENT_RICH_HOSTS: &[&str] = &["github.com", "readthedocs", "pypi.org", "dev.to", "medium.com"];

const CODE_GEN_PROMPT: &str = r#"You are a skill code generator for a personal assistant runtime. Generate a complete Python tool file.

CRITICAL RULES:
1. Return a JSON object with a "code" field containing the COMPLETE Python file as a string.
2. The file MUST import and use: from adjutant_skill import tool
3. Decorate each tool function with: @tool(name="...", description="...")
4. All functions MUST be async (async def) with type hints.
5. Allowed imports: httpx, aiohttp, json, re, datetime, pathlib, typing, pydantic, os, math, collections, itertools, functools, hashlib, base64, urllib.parse, html, textwrap, dataclasses, adjutant_skill
6. FORBIDDEN: subprocess, eval, exec, __import__, os.system, socket, ctypes, shutil.rmtree
7. Use free, no-API-key-required JSON/REST APIs whenever possible.
8. NEVER scrape HTML web pages; always prefer structured JSON API endpoints.
9. If the request implies non-English input (Korean, Japanese, ...), handle that language properly.
10. For free-form natural-language input, parse it with llm_complete() from adjutant_skill instead of regex rules.

CONTEXT FUNCTIONS (from adjutant_skill):
- llm_complete(prompt, system="", temperature=0.7, max_tokens=1024) -> str
- llm_chat(messages, temperature=0.7, max_tokens=1024) -> str
- memory_retain(content, context="", bank_id=None) -> dict
- memory_recall(query, bank_id=None) -> dict

Return ONLY this JSON structure:
{"tool_name": "snake_case_name", "description": "...", "tags": ["..."], "env_required": [], "code": "..."}

The "code" value must be a complete, valid Python file with exactly one @tool decorator per function.
{reference_section}
{error_section}
{skill_memory_section}
User request: {request}"#;

const QUERY_GEN_PROMPT: &str = r#"Extract 2-3 focused web search queries to find reference code and API docs for building the following tool. Each query targets a different aspect.

User request: {request}

Rules:
- Query 1: a working code example (Python preferred)
- Query 2: the specific API documentation for the core feature
- Query 3 (optional): any language/locale challenge
- Each query 5-10 words; include "python" in at least one

Return a JSON array of query strings: ["query 1", "query 2"]"#;

static PRE_CODE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?si)<pre[^>]*>\s*<code[^>]*>(.*?)</code>\s*</pre>").expect("pre/code pattern")
});
static BARE_CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)<code[^>]*>(.*?)</code>").expect("code pattern"));
static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)<script[^>]*>.*?</script>").expect("script pattern"));
static STYLE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)<style[^>]*>.*?</style>").expect("style pattern"));
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag pattern"));
static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("ws pattern"));

/// The LLM's draft of one bundle.
#[derive(Debug, Clone, Deserialize)]
pub struct SkillDraft {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub env_required: Vec<String>,
    #[serde(default)]
    pub code: String,
}

#[derive(Debug)]
pub struct ForgeOutcome {
    pub success: bool,
    pub tool_name: String,
    pub bundle_dir: PathBuf,
    pub tools: Vec<ProbedTool>,
    pub attempts: usize,
    pub last_error: String,
}

pub struct SkillForge {
    router: Arc<LlmRouter>,
    memory: Arc<MemoryCapture>,
    search: Option<Arc<dyn WebSearch>>,
    loader: BundleLoader,
    tester: SkillTester,
    output_dir: PathBuf,
    max_retries: usize,
    http: reqwest::Client,
}

impl SkillForge {
    pub fn new(
        router: Arc<LlmRouter>,
        memory: Arc<MemoryCapture>,
        search: Option<Arc<dyn WebSearch>>,
        loader: BundleLoader,
        tester: SkillTester,
        output_dir: PathBuf,
        max_retries: usize,
    ) -> Self {
        Self {
            router,
            memory,
            search,
            loader,
            tester,
            output_dir,
            max_retries: max_retries.max(1),
            http: reqwest::Client::builder()
                .timeout(PAGE_FETCH_TIMEOUT)
                .user_agent("Mozilla/5.0 (compatible; Adjutant/0.4)")
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn loader(&self) -> &BundleLoader {
        &self.loader
    }

    pub fn output_dir(&self) -> &std::path::Path {
        &self.output_dir
    }

    /// Run the full pipeline for one request. Reference bundles are shared
    /// across retries; only the error section changes between attempts.
    pub async fn generate(&self, request: &str) -> ForgeOutcome {
        let web_refs = self.gather_web_references(request).await;
        let skill_refs = self.gather_skill_memory(request).await;
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            info!(request, attempt, "skill generation attempt");

            let Some(draft) = self.draft(request, &web_refs, &skill_refs, &last_error).await else {
                last_error = "the LLM did not return a valid JSON draft".to_string();
                continue;
            };

            if !is_valid_tool_name(&draft.tool_name) {
                last_error = format!(
                    "invalid_name: {:?} — only letters, digits, and underscores are allowed",
                    draft.tool_name
                );
                warn!(tool_name = %draft.tool_name, attempt, "draft rejected: invalid name");
                continue;
            }

            let report = self.loader.checker().check(&draft.code, &draft.tool_name).await;
            if !report.passed {
                last_error = format!("safety check failed: {}", report.issue_text());
                warn!(tool_name = %draft.tool_name, attempt, "draft rejected by safety checker");
                continue;
            }

            let bundle_dir = self.output_dir.join(&draft.tool_name);
            if let Err(e) = self.write_bundle(&bundle_dir, &draft) {
                last_error = format!("bundle write failed: {}", e);
                continue;
            }

            let tools = match self.loader.load_bundle(&bundle_dir).await {
                Ok(tools) => tools,
                Err(e) => {
                    last_error = format!("hot-load failed: {}", e);
                    discard_bundle(&bundle_dir);
                    continue;
                }
            };

            let probe_target = &tools[0];
            let cases = self.tester.generate_cases(&self.router, probe_target).await;
            let outcomes = self.tester.run_cases(&bundle_dir, &probe_target.name, &cases).await;
            let failed: Vec<_> = outcomes.iter().filter(|o| !o.passed).collect();
            if !failed.is_empty() {
                last_error = format!(
                    "runtime probe failed ({}/{}): {}",
                    failed.len(),
                    outcomes.len(),
                    failed
                        .iter()
                        .map(|o| format!("'{}': {}", o.description, o.error))
                        .collect::<Vec<_>>()
                        .join("; ")
                );
                warn!(tool_name = %draft.tool_name, attempt, failed = failed.len(), "runtime probes failed");
                discard_bundle(&bundle_dir);
                continue;
            }

            info!(tool_name = %draft.tool_name, tools = tools.len(), "skill generated");
            self.retain_creation(&draft).await;
            return ForgeOutcome {
                success: true,
                tool_name: draft.tool_name,
                bundle_dir,
                tools,
                attempts: attempt,
                last_error: String::new(),
            };
        }

        ForgeOutcome {
            success: false,
            tool_name: String::new(),
            bundle_dir: PathBuf::new(),
            tools: vec![],
            attempts: self.max_retries,
            last_error,
        }
    }

    async fn draft(
        &self,
        request: &str,
        web_refs: &str,
        skill_refs: &str,
        last_error: &str,
    ) -> Option<SkillDraft> {
        let reference_section = if web_refs.is_empty() {
            String::new()
        } else {
            format!(
                "\n--- REFERENCE CODE & API DOCS (from web search) ---\nTrust this reference over your training data.\n{}\n--- END REFERENCE ---\n",
                web_refs
            )
        };
        let error_section = if last_error.is_empty() {
            String::new()
        } else {
            format!(
                "\n--- PREVIOUS ATTEMPT FAILED ---\nError: {}\nFix this error; try a DIFFERENT approach if needed.\n--- END ERROR ---\n",
                last_error
            )
        };
        let skill_memory_section = if skill_refs.is_empty() {
            String::new()
        } else {
            format!(
                "\n--- EXISTING/DELETED SKILL HISTORY ---\n{}\nIf a similar skill exists, avoid duplication. If a similar skill was DELETED, do NOT recreate it.\n--- END HISTORY ---\n",
                skill_refs
            )
        };

        let prompt = CODE_GEN_PROMPT
            .replace("{reference_section}", &reference_section)
            .replace("{error_section}", &error_section)
            .replace("{skill_memory_section}", &skill_memory_section)
            .replace("{request}", request);

        let completion = self
            .router
            .complete_with(
                vec![ChatMessage::user(prompt)],
                None,
                None,
                Some(Role::Code),
                Some(0.3),
                None,
                Some(ResponseFormat::JsonObject),
            )
            .await
            .ok()?;
        let content = completion.content?;
        match serde_json::from_str::<SkillDraft>(&content) {
            Ok(draft) if !draft.code.is_empty() => Some(draft),
            Ok(_) => {
                warn!("draft JSON carried no code field");
                None
            }
            Err(e) => {
                warn!(error = %e, "draft JSON parse failed");
                None
            }
        }
    }

    fn write_bundle(&self, dir: &PathBuf, draft: &SkillDraft) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("tool.py"), &draft.code)?;
        let meta = BundleMeta {
            name: draft.tool_name.clone(),
            version: "1.0.0".into(),
            description: draft.description.clone(),
            author: Some("adjutant-agent".into()),
            auto_generated: true,
            created: Some(Utc::now().format("%Y-%m-%d").to_string()),
            license: Some("MIT".into()),
            tags: draft.tags.clone(),
            tools: vec![],
            env_required: draft.env_required.clone(),
        };
        std::fs::write(dir.join("tool.yaml"), serde_yaml_ng::to_string(&meta)?)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reference gathering (best-effort; every failure collapses to "")
    // ------------------------------------------------------------------

    async fn gather_web_references(&self, request: &str) -> String {
        let Some(ref search) = self.search else {
            return String::new();
        };

        let queries = self.generate_search_queries(request).await;
        let mut merged: Vec<crate::search::SearchHit> = Vec::new();
        let mut seen_urls = std::collections::HashSet::new();
        for query in &queries {
            match search.text(query, 5).await {
                Ok(hits) => {
                    for hit in hits {
                        if !hit.href.is_empty() && seen_urls.insert(hit.href.clone()) {
                            merged.push(hit);
                        }
                    }
                }
                Err(e) => debug!(query, error = %e, "search query failed"),
            }
        }
        if merged.is_empty() {
            info!(?queries, "web search produced no results");
            return String::new();
        }

        let mut reference = merged
            .iter()
            .take(SNIPPET_LIMIT)
            .map(|hit| format!("- {}\n  URL: {}\n  {}", hit.title, hit.href, hit.body))
            .collect::<Vec<_>>()
            .join("\n");

        let mut crawl_targets: Vec<&str> = merged
            .iter()
            .take(4)
            .filter(|hit| CONTENT_RICH_HOSTS.iter().any(|host| hit.href.contains(host)))
            .map(|hit| hit.href.as_str())
            .collect();
        if crawl_targets.is_empty() {
            crawl_targets = merged.iter().take(CRAWL_LIMIT).map(|hit| hit.href.as_str()).collect();
        }

        let mut pages = Vec::new();
        for url in crawl_targets.into_iter().take(CRAWL_LIMIT) {
            let content = self.fetch_page(url).await;
            if !content.is_empty() {
                pages.push(format!("[Content from {}]\n{}", url, content));
            }
        }
        if !pages.is_empty() {
            reference.push_str("\n\n--- PAGE CONTENTS ---\n");
            reference.push_str(&pages.join("\n\n"));
        }
        info!(
            queries = queries.len(),
            results = merged.len(),
            ref_len = reference.len(),
            "web reference gathering complete"
        );
        reference
    }

    async fn generate_search_queries(&self, request: &str) -> Vec<String> {
        let prompt = QUERY_GEN_PROMPT.replace("{request}", request);
        let result = self
            .router
            .complete_with(
                vec![ChatMessage::user(prompt)],
                None,
                None,
                Some(Role::Code),
                Some(0.2),
                Some(200),
                Some(ResponseFormat::JsonObject),
            )
            .await;

        if let Ok(completion) = result {
            if let Some(content) = completion.content {
                if let Some(queries) = parse_query_list(&content) {
                    if !queries.is_empty() {
                        return queries;
                    }
                }
            }
        }
        vec![format!("python {} API example code", request)]
    }

    /// Fetch one reference page: `<pre><code>` blocks first, plain text
    /// second, truncated hard. Search hits are untrusted input, so the URL
    /// must clear the SSRF guard before any request goes out.
    async fn fetch_page(&self, url: &str) -> String {
        if let Err(reason) = crate::url_security::validate_url(url) {
            debug!(url, reason = %reason, "reference URL rejected");
            return String::new();
        }
        let response = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url, error = %e, "page fetch failed");
                return String::new();
            }
        };
        let is_plain = url.contains("raw.githubusercontent.com")
            || response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.starts_with("text/plain"));
        let body = match response.text().await {
            Ok(b) => b,
            Err(_) => return String::new(),
        };
        if is_plain {
            return truncate_chars(&body, PAGE_TEXT_LIMIT);
        }

        let text = strip_html(&body);
        let blocks = extract_code_blocks(&body);
        let combined = if blocks.is_empty() {
            text
        } else {
            format!("[CODE EXAMPLES]\n{}\n\n[PAGE TEXT]\n{}", blocks[..blocks.len().min(3)].join("\n\n"), text)
        };
        truncate_chars(&combined, PAGE_TEXT_LIMIT)
    }

    async fn gather_skill_memory(&self, request: &str) -> String {
        match self.memory.recall(&format!("skill: {}", request), SKILL_BANK).await {
            Ok(result) => {
                if !result.context.is_empty() {
                    info!(context_len = result.context.len(), "skill memory found");
                    result.context
                } else {
                    result
                        .memories
                        .iter()
                        .map(|m| m.content.as_str())
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            Err(e) => {
                warn!(error = %e, "skill memory recall failed");
                String::new()
            }
        }
    }

    // ------------------------------------------------------------------
    // Skill bank records
    // ------------------------------------------------------------------

    async fn retain_creation(&self, draft: &SkillDraft) {
        let content = format!(
            "[skill created] {}\ndescription: {}\ntags: {}\ncreated: {}\nstatus: active\ncode:\n{}",
            draft.tool_name,
            draft.description,
            draft.tags.join(", "),
            Utc::now().format("%Y-%m-%d %H:%M"),
            truncate_chars(&draft.code, CODE_EXCERPT_LIMIT),
        );
        if let Err(e) = self
            .memory
            .retain(&content, &format!("auto-generated skill: {}", draft.tool_name), SKILL_BANK)
            .await
        {
            warn!(tool_name = %draft.tool_name, error = %e, "skill creation record failed");
        }
    }

    /// Record a deletion so a later request for the same skill is told not
    /// to recreate it.
    pub async fn record_deletion(&self, tool_name: &str, description: &str) {
        let content = format!(
            "[skill deleted] {}\ndescription: {}\ndeleted: {}\nstatus: deleted\nnote: the user removed this skill; do not recreate it.",
            tool_name,
            description,
            Utc::now().format("%Y-%m-%d %H:%M"),
        );
        if let Err(e) = self
            .memory
            .retain(&content, &format!("deleted skill: {}", tool_name), SKILL_BANK)
            .await
        {
            warn!(tool_name, error = %e, "skill deletion record failed");
        }
    }
}

fn discard_bundle(dir: &PathBuf) {
    if dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            warn!(dir = %dir.display(), error = %e, "failed to discard bundle");
        }
    }
}

/// Accept a bare array or `{"queries": [...]}` / `{"search_queries": [...]}`.
fn parse_query_list(content: &str) -> Option<Vec<String>> {
    let value: Value = serde_json::from_str(content).ok()?;
    let array = match value {
        Value::Array(items) => items,
        Value::Object(ref map) => map
            .get("queries")
            .or_else(|| map.get("search_queries"))
            .and_then(Value::as_array)
            .cloned()?,
        _ => return None,
    };
    Some(
        array
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .filter(|q| q.len() > 3)
            .take(3)
            .collect(),
    )
}

fn strip_html(html: &str) -> String {
    let text = SCRIPT_BLOCK.replace_all(html, "");
    let text = STYLE_BLOCK.replace_all(&text, "");
    let text = ANY_TAG.replace_all(&text, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">");
    WHITESPACE_RUN.replace_all(&text, " ").trim().to_string()
}

fn extract_code_blocks(html: &str) -> Vec<String> {
    let mut blocks: Vec<String> = PRE_CODE_BLOCK
        .captures_iter(html)
        .map(|caps| decode_code(&caps[1]))
        .filter(|code| code.len() > 20)
        .collect();

    if blocks.is_empty() {
        blocks = BARE_CODE_BLOCK
            .captures_iter(html)
            .filter(|caps| caps[1].contains('\n') && caps[1].len() > 50)
            .map(|caps| decode_code(&caps[1]))
            .collect();
    }
    blocks
}

fn decode_code(raw: &str) -> String {
    let code = ANY_TAG.replace_all(raw, "");
    code.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .trim()
        .to_string()
}

fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use crate::forge::python::test_runtime;
    use crate::llm::router::ProviderKind;
    use crate::llm::{Completion, CompletionRequest, LlmClient, StreamChunk};
    use crate::memory::signal::SensitiveDetector;
    use crate::memory::{MemoryEngine, RecallResult, ReflectReceipt, RetainReceipt};
    use async_trait::async_trait;
    use futures_util::stream::BoxStream;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Client replaying a scripted sequence of completions.
    struct ScriptedClient {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<String>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(&self, model: &str, _request: CompletionRequest) -> anyhow::Result<Completion> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                anyhow::bail!("script exhausted");
            }
            Ok(Completion {
                content: Some(responses.remove(0)),
                tool_calls: vec![],
                model: model.to_string(),
            })
        }

        async fn stream(
            &self,
            _model: &str,
            _request: CompletionRequest,
        ) -> anyhow::Result<BoxStream<'static, anyhow::Result<StreamChunk>>> {
            anyhow::bail!("not used")
        }
    }

    struct RecordingEngine {
        retained: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MemoryEngine for RecordingEngine {
        async fn retain(&self, text: &str, _context: &str, bank_id: &str) -> anyhow::Result<RetainReceipt> {
            self.retained.lock().unwrap().push((bank_id.to_string(), text.to_string()));
            Ok(RetainReceipt {
                status: "ok".into(),
                bank_id: bank_id.into(),
                content_length: text.len(),
                facts_detected: 0,
                log_path: None,
            })
        }

        async fn recall(&self, query: &str, bank_id: &str) -> anyhow::Result<RecallResult> {
            Ok(RecallResult::empty(query, bank_id))
        }

        async fn reflect(&self, bank_id: &str) -> anyhow::Result<ReflectReceipt> {
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

    fn scripted_router(responses: Vec<String>) -> Arc<LlmRouter> {
        let mut clients: HashMap<ProviderKind, Arc<dyn LlmClient>> = HashMap::new();
        clients.insert(ProviderKind::OpenAi, Arc::new(ScriptedClient::new(responses)));
        Arc::new(
            LlmRouter::new(
                &LlmConfig {
                    models: vec!["gpt-5-mini".into()],
                    ..Default::default()
                },
                clients,
            )
            .unwrap(),
        )
    }

    fn forge_with(
        tmp: &std::path::Path,
        router: Arc<LlmRouter>,
        engine: Arc<RecordingEngine>,
    ) -> Option<SkillForge> {
        let runtime = test_runtime(tmp);
        if !runtime.is_available() {
            eprintln!("python3 unavailable; skipping");
            return None;
        }
        let memory = Arc::new(MemoryCapture::new(engine, None, SensitiveDetector::new()));
        Some(SkillForge::new(
            router,
            memory,
            None,
            BundleLoader::new(runtime.clone()),
            SkillTester::new(runtime),
            tmp.join("generated"),
            3,
        ))
    }

    const GOOD_CODE: &str = "from adjutant_skill import tool\n\n\n@tool(name=\"echo2\", description=\"Echo a message\")\nasync def echo2(m: str) -> dict:\n    return {\"echoed\": m}\n";

    fn good_draft() -> String {
        json!({
            "tool_name": "echo2",
            "description": "Echo a message",
            "tags": ["util"],
            "env_required": [],
            "code": GOOD_CODE,
        })
        .to_string()
    }

    fn cases_reply() -> String {
        json!([{"description": "happy", "kwargs": {"m": "hello"}, "expect_error": false}]).to_string()
    }

    #[tokio::test]
    async fn happy_path_writes_bundle_and_records_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Arc::new(RecordingEngine {
            retained: Mutex::new(vec![]),
        });
        // call order: draft, then probe-case generation
        let router = scripted_router(vec![good_draft(), cases_reply()]);
        let Some(forge) = forge_with(tmp.path(), router, engine.clone()) else { return };

        let outcome = forge.generate("echo 도구 만들어줘").await;
        assert!(outcome.success, "{}", outcome.last_error);
        assert_eq!(outcome.tool_name, "echo2");
        assert_eq!(outcome.attempts, 1);
        assert!(tmp.path().join("generated/echo2/tool.py").exists());
        assert!(tmp.path().join("generated/echo2/tool.yaml").exists());

        let meta = BundleLoader::load_meta(&tmp.path().join("generated/echo2")).unwrap();
        assert!(meta.auto_generated);
        assert_eq!(meta.name, "echo2");

        let retained = engine.retained.lock().unwrap();
        assert!(retained.iter().any(|(bank, text)| bank == SKILL_BANK && text.contains("[skill created] echo2")));
    }

    #[tokio::test]
    async fn retries_then_fails_without_committing() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Arc::new(RecordingEngine {
            retained: Mutex::new(vec![]),
        });
        let bad_pattern = json!({
            "tool_name": "runner",
            "description": "shells out",
            "tags": [],
            "env_required": [],
            "code": "import subprocess\n\nasync def runner() -> None:\n    subprocess.run([\"ls\"])\n",
        })
        .to_string();
        let raising_code = json!({
            "tool_name": "broken_probe",
            "description": "raises at runtime",
            "tags": [],
            "env_required": [],
            "code": "from adjutant_skill import tool\n\n\n@tool(name=\"broken_probe\", description=\"x\")\nasync def broken_probe(m: str) -> dict:\n    raise ValueError(\"always\")\n",
        })
        .to_string();
        // attempt 1: forbidden pattern; attempt 2: invalid JSON; attempt 3:
        // loads but the runtime probe raises
        let router = scripted_router(vec![
            bad_pattern,
            "{not json".to_string(),
            raising_code,
            cases_reply(),
        ]);
        let Some(forge) = forge_with(tmp.path(), router, engine) else { return };

        let outcome = forge.generate("weird tool").await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.last_error.contains("runtime probe failed"));
        assert!(!tmp.path().join("generated/runner").exists());
        assert!(!tmp.path().join("generated/broken_probe").exists(), "failed bundles must not be committed");
    }

    #[tokio::test]
    async fn invalid_draft_name_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Arc::new(RecordingEngine {
            retained: Mutex::new(vec![]),
        });
        let traversal = json!({
            "tool_name": "../escape",
            "description": "", "tags": [], "env_required": [],
            "code": "x = 1",
        })
        .to_string();
        let router = scripted_router(vec![traversal.clone(), traversal.clone(), traversal]);
        let Some(forge) = forge_with(tmp.path(), router, engine) else { return };

        let outcome = forge.generate("escape").await;
        assert!(!outcome.success);
        assert!(outcome.last_error.contains("invalid_name"));
        assert!(!tmp.path().join("generated").join("../escape").exists());
    }

    #[tokio::test]
    async fn deletion_record_lands_in_skill_bank() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Arc::new(RecordingEngine {
            retained: Mutex::new(vec![]),
        });
        let router = scripted_router(vec![]);
        let Some(forge) = forge_with(tmp.path(), router, engine.clone()) else { return };

        forge.record_deletion("echo2", "Echo a message").await;
        let retained = engine.retained.lock().unwrap();
        assert!(retained.iter().any(|(bank, text)| bank == SKILL_BANK && text.contains("[skill deleted] echo2")));
    }

    #[test]
    fn query_list_parsing() {
        assert_eq!(
            parse_query_list(r#"["python weather api", "openweather docs"]"#).unwrap(),
            vec!["python weather api", "openweather docs"]
        );
        assert_eq!(
            parse_query_list(r#"{"queries": ["python weather api"]}"#).unwrap(),
            vec!["python weather api"]
        );
        // too-short entries are dropped
        assert!(parse_query_list(r#"["ab"]"#).unwrap().is_empty());
        assert!(parse_query_list("nope").is_none());
    }

    #[test]
    fn html_helpers() {
        let html = "<html><script>bad()</script><pre><code>import httpx\nprint(1)</code></pre><p>Docs &amp; text</p></html>";
        let blocks = extract_code_blocks(html);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].contains("import httpx"));
        let text = strip_html(html);
        assert!(text.contains("Docs & text"));
        assert!(!text.contains("bad()"));
    }

    #[test]
    fn truncation_is_char_safe() {
        let korean = "가나다라마바사".repeat(1000);
        let out = truncate_chars(&korean, 10);
        assert_eq!(out.chars().count(), 10);
    }

    #[tokio::test]
    async fn fetch_page_refuses_internal_targets() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Arc::new(RecordingEngine {
            retained: Mutex::new(vec![]),
        });
        let router = scripted_router(vec![]);
        let Some(forge) = forge_with(tmp.path(), router, engine) else { return };

        // a poisoned search hit must never produce an outbound request
        assert_eq!(forge.fetch_page("http://169.254.169.254/latest/meta-data/").await, "");
        assert_eq!(forge.fetch_page("http://127.0.0.1:6379/").await, "");
        assert_eq!(forge.fetch_page("file:///etc/passwd").await, "");
    }
}

//! Runtime probes for freshly generated bundles.
//!
//! Test cases come from the LLM (matched to the declared parameter
//! schema), falling back to a single synthetic case built from per-type
//! defaults. A case passes when the function returns without raising (or
//! raises when expected); a mapping with `ok=false` is the tool's own
//! graceful error and also counts as a pass.

use crate::forge::python::{InvokeReport, ProbedTool, PythonRuntime};
use crate::llm::{LlmRouter, ResponseFormat, Role};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const CASE_TIMEOUT: Duration = Duration::from_secs(60);
const CASE_COUNT: usize = 3;

const TEST_CASE_PROMPT: &str = "\
Generate {count} test cases for a tool function.

Tool name: {tool_name}
Tool description: {tool_description}
Parameters: {parameters}

Rules:
1. Test case 1: normal/happy-path with realistic input. If the tool handles \
Korean, use Korean text.
2. Test case 2: edge case (empty string, boundary value, special characters).
3. Test case 3: another valid input, different from #1.
4. All kwargs must match the function's parameter names and types exactly.
5. expect_error should be false for most cases.

Return a JSON array:
[{\"description\": \"...\", \"kwargs\": {\"param\": \"value\"}, \"expect_error\": false}, ...]";

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeCase {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub expect_error: bool,
}

#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub description: String,
    pub passed: bool,
    pub error: String,
    pub elapsed: Duration,
}

pub struct SkillTester {
    python: PythonRuntime,
}

impl SkillTester {
    pub fn new(python: PythonRuntime) -> Self {
        Self { python }
    }

    /// Ask the LLM for probe cases; fall back to type defaults when the
    /// call or its JSON fails.
    pub async fn generate_cases(
        &self,
        router: &LlmRouter,
        tool: &ProbedTool,
    ) -> Vec<ProbeCase> {
        let prompt = TEST_CASE_PROMPT
            .replace("{count}", &CASE_COUNT.to_string())
            .replace("{tool_name}", &tool.name)
            .replace("{tool_description}", &tool.description)
            .replace(
                "{parameters}",
                &serde_json::to_string(&tool.parameters).unwrap_or_default(),
            );

        let result = router
            .complete_with(
                vec![crate::llm::ChatMessage::user(prompt)],
                None,
                None,
                Some(Role::Code),
                Some(0.3),
                Some(500),
                Some(ResponseFormat::JsonObject),
            )
            .await;

        if let Ok(completion) = result {
            if let Some(cases) = parse_cases(completion.content.as_deref().unwrap_or("")) {
                if !cases.is_empty() {
                    info!(tool = %tool.name, count = cases.len(), "probe cases generated");
                    return cases.into_iter().take(CASE_COUNT).collect();
                }
            }
        }
        warn!(tool = %tool.name, "probe case generation failed, using type defaults");
        vec![fallback_case(&tool.parameters)]
    }

    /// Execute each case against the bundle with a per-case deadline.
    pub async fn run_cases(
        &self,
        bundle_dir: &Path,
        tool_name: &str,
        cases: &[ProbeCase],
    ) -> Vec<ProbeOutcome> {
        let mut outcomes = Vec::with_capacity(cases.len());
        for case in cases {
            let start = Instant::now();
            let kwargs = Value::Object(case.kwargs.clone());
            let report = self.python.invoke(bundle_dir, tool_name, &kwargs, CASE_TIMEOUT).await;
            let elapsed = start.elapsed();

            let outcome = match report {
                Ok(InvokeReport::Returned(value)) => {
                    if value.get("ok") == Some(&Value::Bool(false)) && !case.expect_error {
                        // graceful domain error, the code itself ran cleanly
                        warn!(
                            case = %case.description,
                            error = value.get("error").and_then(serde_json::Value::as_str).unwrap_or(""),
                            "probe returned ok=false"
                        );
                    }
                    ProbeOutcome {
                        description: case.description.clone(),
                        passed: true,
                        error: String::new(),
                        elapsed,
                    }
                }
                Ok(InvokeReport::Raised(msg)) => ProbeOutcome {
                    description: case.description.clone(),
                    passed: case.expect_error,
                    error: msg,
                    elapsed,
                },
                Ok(InvokeReport::Fatal(msg)) => ProbeOutcome {
                    description: case.description.clone(),
                    passed: false,
                    error: msg,
                    elapsed,
                },
                Err(e) => ProbeOutcome {
                    description: case.description.clone(),
                    passed: false,
                    error: e.to_string(),
                    elapsed,
                },
            };
            info!(case = %outcome.description, passed = outcome.passed, "probe case executed");
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// Parse either a bare JSON array or `{"test_cases": [...]}` / `{"tests":
/// [...]}` wrappers.
fn parse_cases(content: &str) -> Option<Vec<ProbeCase>> {
    let value: Value = serde_json::from_str(content).ok()?;
    let array = match value {
        Value::Array(items) => items,
        Value::Object(ref map) => map
            .get("test_cases")
            .or_else(|| map.get("tests"))
            .and_then(Value::as_array)
            .cloned()?,
        _ => return None,
    };
    Some(
        array
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
    )
}

/// One synthetic case from per-type defaults.
fn fallback_case(parameters: &Map<String, Value>) -> ProbeCase {
    let mut kwargs = Map::new();
    for (pname, pinfo) in parameters {
        let ptype = pinfo.get("type").and_then(Value::as_str).unwrap_or("str");
        let default = match crate::tools::normalize_param_type(ptype) {
            "integer" => json!(1),
            "number" => json!(1.0),
            "boolean" => json!(true),
            _ => json!("test"),
        };
        kwargs.insert(pname.clone(), default);
    }
    ProbeCase {
        description: "type-default fallback".into(),
        kwargs,
        expect_error: false,
    }
}

//! Skill bundle loading and discovery.
//!
//! A bundle is a directory holding `tool.py` (the executable source) and
//! `tool.yaml` (the descriptor), optionally disabled by a `.disabled`
//! sentinel file. Loading validates the source before any interpreter
//! execution; a failed load leaves the registry untouched.

use crate::forge::python::{InvokeReport, ProbedTool, PythonRuntime};
use crate::forge::safety::CodeSafetyChecker;
use crate::tools::{ToolDescriptor, ToolInvoker, ToolOrigin, schema_from_probe_params};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

const INVOKE_TIMEOUT: Duration = Duration::from_secs(60);

/// `tool.yaml` contents.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BundleMeta {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub auto_generated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<BundleToolMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_required: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleToolMeta {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Invoker running one exported tool function through the interpreter.
pub struct BundleInvoker {
    python: PythonRuntime,
    bundle_dir: PathBuf,
    tool_name: String,
}

#[async_trait]
impl ToolInvoker for BundleInvoker {
    async fn invoke(&self, arguments: Value) -> Result<Value> {
        let report = self
            .python
            .invoke(&self.bundle_dir, &self.tool_name, &arguments, INVOKE_TIMEOUT)
            .await?;
        match report {
            InvokeReport::Returned(value) => Ok(value),
            InvokeReport::Raised(msg) => Err(anyhow!("{}", msg)),
            InvokeReport::Fatal(msg) => Err(anyhow!("bundle failure: {}", msg)),
        }
    }
}

pub struct BundleLoader {
    python: PythonRuntime,
    checker: CodeSafetyChecker,
}

impl BundleLoader {
    pub fn new(python: PythonRuntime) -> Self {
        let checker = CodeSafetyChecker::new(python.clone());
        Self { python, checker }
    }

    pub fn checker(&self) -> &CodeSafetyChecker {
        &self.checker
    }

    /// Validate and activate one bundle directory: safety check, then an
    /// isolated-namespace probe enumerating the exported tools.
    pub async fn load_bundle(&self, dir: &Path) -> Result<Vec<ProbedTool>> {
        let source_path = dir.join("tool.py");
        let source = std::fs::read_to_string(&source_path)
            .with_context(|| format!("cannot read {}", source_path.display()))?;

        let bundle_name = dir.file_name().and_then(|n| n.to_str()).unwrap_or("bundle");
        let report = self.checker.check(&source, bundle_name).await;
        if !report.passed {
            return Err(anyhow!("safety check failed: {}", report.issue_text()));
        }

        let probe = self.python.probe(dir).await?;
        if !probe.ok {
            let line = probe.line.map(|l| format!(" (line {})", l)).unwrap_or_default();
            return Err(anyhow!("bundle load failed{}: {}", line, probe.error.unwrap_or_default()));
        }
        if probe.tools.is_empty() {
            return Err(anyhow!("bundle exports no tool functions"));
        }
        info!(dir = %dir.display(), tools = probe.tools.len(), "bundle loaded");
        Ok(probe.tools)
    }

    /// Build registry descriptors for a loaded bundle.
    pub fn descriptors(&self, dir: &Path, tools: &[ProbedTool]) -> Vec<ToolDescriptor> {
        tools
            .iter()
            .map(|tool| {
                let invoker: Arc<dyn ToolInvoker> = Arc::new(BundleInvoker {
                    python: self.python.clone(),
                    bundle_dir: dir.to_path_buf(),
                    tool_name: tool.name.clone(),
                });
                ToolDescriptor::new(
                    tool.name.clone(),
                    tool.description.clone(),
                    schema_from_probe_params(&tool.parameters),
                    ToolOrigin::Dynamic,
                    invoker,
                )
                .with_tags(tool.tags.clone())
            })
            .collect()
    }

    pub fn load_meta(dir: &Path) -> Option<BundleMeta> {
        let yaml_path = dir.join("tool.yaml");
        let content = std::fs::read_to_string(&yaml_path).ok()?;
        match serde_yaml_ng::from_str(&content) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(path = %yaml_path.display(), error = %e, "tool.yaml parse failed");
                None
            }
        }
    }

    /// Discover loadable bundle directories: one level under `root` plus
    /// `root/generated/`, skipping hidden names, `__`-prefixed names, and
    /// bundles carrying a `.disabled` sentinel.
    pub fn scan(root: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        collect_bundles(root, &mut found);
        collect_bundles(&root.join("generated"), &mut found);
        found.sort();
        found
    }
}

fn collect_bundles(dir: &Path, out: &mut Vec<PathBuf>) {
    for entry in WalkDir::new(dir).max_depth(1).into_iter().flatten() {
        if !entry.file_type().is_dir() || entry.path() == dir {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') || name.starts_with("__") || name == "generated" {
            continue;
        }
        let path = entry.path();
        if !path.join("tool.py").exists() || path.join(".disabled").exists() {
            continue;
        }
        out.push(path.to_path_buf());
    }
}

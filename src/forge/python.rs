//! Side-loaded Python interpreter for dynamic tool bundles.
//!
//! Generated tools stay Python source. The host never executes that source
//! in-process: a `python3` subprocess runs one of the embedded drivers and
//! answers with a single JSON object on stdout. Generated code reaches host
//! LLM/memory through the `adjutant_skill` shim module, whose context calls
//! go over the Unix-socket capability service.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// The shim module importable as `adjutant_skill` from generated code:
/// the `@tool` marker decorator plus socket-backed context functions.
const SHIM_SOURCE: &str = r#"
import asyncio
import inspect
import json
import os

_SOCKET = os.environ.get("ADJUTANT_CONTEXT_SOCK", "")

_TYPE_MAP = {int: "integer", float: "number", str: "string", bool: "boolean", list: "array", dict: "object"}


def _extract_parameters(func):
    sig = inspect.signature(func)
    params = {}
    for pname, param in sig.parameters.items():
        annotation = param.annotation
        ptype = "string"
        if annotation is not inspect.Parameter.empty:
            ptype = _TYPE_MAP.get(annotation, getattr(annotation, "__name__", str(annotation)))
        info = {"type": ptype}
        if param.default is inspect.Parameter.empty:
            info["required"] = True
        else:
            info["required"] = False
            try:
                json.dumps(param.default)
                info["default"] = param.default
            except TypeError:
                pass
        params[pname] = info
    return params


def tool(name, description="", tags=None):
    def decorator(func):
        func._adjutant_tool = True
        func._tool_name = name
        func._tool_description = description or (func.__doc__ or "")
        func._tool_tags = tags or []
        func._tool_parameters = _extract_parameters(func)
        return func

    return decorator


async def _call(op, data):
    if not _SOCKET:
        raise RuntimeError("skill context is not initialized")
    reader, writer = await asyncio.open_unix_connection(_SOCKET)
    try:
        writer.write(json.dumps({"op": op, "data": data}).encode("utf-8"))
        writer.write_eof()
        await writer.drain()
        raw = await reader.read(1024 * 1024)
    finally:
        writer.close()
        await writer.wait_closed()
    resp = json.loads(raw.decode("utf-8"))
    if not resp.get("ok"):
        raise RuntimeError(resp.get("error", "skill context call failed"))
    return resp.get("data")


async def llm_complete(prompt, system="", temperature=0.7, max_tokens=1024):
    return await _call("llm_complete", {"prompt": prompt, "system": system, "temperature": temperature, "max_tokens": max_tokens})


async def llm_chat(messages, temperature=0.7, max_tokens=1024):
    return await _call("llm_chat", {"messages": messages, "temperature": temperature, "max_tokens": max_tokens})


async def memory_retain(content, context="", bank_id=None):
    return await _call("memory_retain", {"content": content, "context": context, "bank_id": bank_id})


async def memory_recall(query, bank_id=None):
    return await _call("memory_recall", {"query": query, "bank_id": bank_id})
"#;

const SYNTAX_DRIVER: &str = r#"
import ast
import json
import sys

source = sys.stdin.read()
try:
    ast.parse(source)
    print(json.dumps({"ok": True}))
except SyntaxError as e:
    print(json.dumps({"ok": False, "msg": e.msg or "syntax error", "line": e.lineno}))
"#;

const PROBE_DRIVER: &str = r#"
import json
import os
import sys

tool_dir = sys.argv[1]
src_path = os.path.join(tool_dir, "tool.py")
try:
    with open(src_path, encoding="utf-8") as f:
        source = f.read()
except OSError as e:
    print(json.dumps({"ok": False, "error": "cannot read tool.py: %s" % e}))
    sys.exit(0)

namespace = {"__name__": "adjutant_bundle", "__file__": src_path}
try:
    code = compile(source, src_path, "exec")
except SyntaxError as e:
    print(json.dumps({"ok": False, "error": "syntax error: %s" % (e.msg or ""), "line": e.lineno}))
    sys.exit(0)
try:
    exec(code, namespace)
except Exception as e:
    print(json.dumps({"ok": False, "error": "%s: %s" % (type(e).__name__, e)}))
    sys.exit(0)

tools = []
for obj in namespace.values():
    if getattr(obj, "_adjutant_tool", False):
        tools.append({
            "name": obj._tool_name,
            "description": obj._tool_description,
            "tags": obj._tool_tags,
            "parameters": obj._tool_parameters,
        })
print(json.dumps({"ok": True, "tools": tools}))
"#;

const INVOKE_DRIVER: &str = r#"
import asyncio
import inspect
import json
import os
import sys

tool_dir, tool_name = sys.argv[1], sys.argv[2]
kwargs = json.loads(sys.stdin.read() or "{}")
src_path = os.path.join(tool_dir, "tool.py")

namespace = {"__name__": "adjutant_bundle", "__file__": src_path}
try:
    with open(src_path, encoding="utf-8") as f:
        source = f.read()
    exec(compile(source, src_path, "exec"), namespace)
except Exception as e:
    print(json.dumps({"status": "fatal", "error": "%s: %s" % (type(e).__name__, e)}))
    sys.exit(0)

func = None
for obj in namespace.values():
    if getattr(obj, "_adjutant_tool", False) and obj._tool_name == tool_name:
        func = obj
        break
if func is None:
    print(json.dumps({"status": "fatal", "error": "tool function %r not found" % tool_name}))
    sys.exit(0)

try:
    if inspect.iscoroutinefunction(func):
        result = asyncio.run(func(**kwargs))
    else:
        result = func(**kwargs)
    try:
        payload = json.loads(json.dumps(result, default=str))
    except (TypeError, ValueError):
        payload = str(result)
    print(json.dumps({"status": "returned", "result": payload}))
except Exception as e:
    print(json.dumps({"status": "raised", "error": "%s: %s" % (type(e).__name__, e)}))
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct SyntaxVerdict {
    pub ok: bool,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub line: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbedTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeReport {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default)]
    pub tools: Vec<ProbedTool>,
}

/// Outcome of one tool invocation inside the interpreter.
#[derive(Debug, Clone)]
pub enum InvokeReport {
    /// The function returned this JSON value.
    Returned(Value),
    /// The function raised; payload is the exception text.
    Raised(String),
    /// The bundle could not be loaded or the function was missing.
    Fatal(String),
}

/// Handle to the configured interpreter plus the shim install dir.
#[derive(Clone)]
pub struct PythonRuntime {
    python_bin: String,
    shim_dir: PathBuf,
    context_socket: Option<PathBuf>,
}

impl PythonRuntime {
    /// Write the shim module under `state_dir` and return a runtime handle.
    pub fn new(python_bin: &str, state_dir: &Path, context_socket: Option<PathBuf>) -> Result<Self> {
        let shim_dir = state_dir.join("shim");
        std::fs::create_dir_all(&shim_dir)?;
        std::fs::write(shim_dir.join("adjutant_skill.py"), SHIM_SOURCE)?;
        Ok(Self {
            python_bin: python_bin.to_string(),
            shim_dir,
            context_socket,
        })
    }

    pub fn is_available(&self) -> bool {
        std::process::Command::new(&self.python_bin)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn run(
        &self,
        driver: &str,
        args: &[&str],
        stdin_payload: &str,
        timeout: Duration,
    ) -> Result<String> {
        let mut command = tokio::process::Command::new(&self.python_bin);
        command
            .arg("-c")
            .arg(driver)
            .args(args)
            .env("PYTHONPATH", &self.shim_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref socket) = self.context_socket {
            command.env("ADJUTANT_CONTEXT_SOCK", socket);
        }

        let mut child = command.spawn().context("failed to spawn python interpreter")?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(stdin_payload.as_bytes()).await?;
            drop(stdin);
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("python driver timed out after {}s", timeout.as_secs()))??;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("python driver produced no output: {}", stderr.trim()));
        }
        debug!(bytes = stdout.len(), "python driver replied");
        Ok(stdout)
    }

    /// `ast.parse` the source inside the interpreter.
    pub async fn check_syntax(&self, source: &str) -> Result<SyntaxVerdict> {
        let out = self.run(SYNTAX_DRIVER, &[], source, Duration::from_secs(15)).await?;
        serde_json::from_str(&out).context("malformed syntax verdict")
    }

    /// Execute `tool.py` in an isolated namespace and enumerate exported
    /// tools. The source must already have passed the safety checker.
    pub async fn probe(&self, bundle_dir: &Path) -> Result<ProbeReport> {
        let dir = bundle_dir.to_string_lossy();
        let out = self.run(PROBE_DRIVER, &[dir.as_ref()], "", Duration::from_secs(30)).await?;
        serde_json::from_str(&out).context("malformed probe report")
    }

    /// Call one exported tool function with JSON kwargs.
    pub async fn invoke(
        &self,
        bundle_dir: &Path,
        tool_name: &str,
        kwargs: &Value,
        timeout: Duration,
    ) -> Result<InvokeReport> {
        let dir = bundle_dir.to_string_lossy();
        let payload = serde_json::to_string(kwargs)?;
        let out = self
            .run(INVOKE_DRIVER, &[dir.as_ref(), tool_name], &payload, timeout)
            .await?;
        let parsed: Value = serde_json::from_str(&out).context("malformed invoke report")?;
        match parsed.get("status").and_then(Value::as_str) {
            Some("returned") => Ok(InvokeReport::Returned(parsed.get("result").cloned().unwrap_or(Value::Null))),
            Some("raised") => Ok(InvokeReport::Raised(
                parsed.get("error").and_then(Value::as_str).unwrap_or("").to_string(),
            )),
            Some("fatal") => Ok(InvokeReport::Fatal(
                parsed.get("error").and_then(Value::as_str).unwrap_or("").to_string(),
            )),
            other => Err(anyhow!("unknown invoke status: {:?}", other)),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_runtime(state_dir: &Path) -> PythonRuntime {
    PythonRuntime::new("python3", state_dir, None).expect("shim install")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ECHO_BUNDLE: &str = r#"
from adjutant_skill import tool


@tool(name="echo2", description="Echo a message back")
async def echo2(m: str) -> dict:
    return {"echoed": m}


@tool(name="always_fails", description="Raises on purpose")
async def always_fails(m: str) -> dict:
    raise ValueError("nope: " + m)
"#;

    fn write_bundle(dir: &Path, source: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("tool.py"), source).unwrap();
    }

    #[tokio::test]
    async fn probe_enumerates_decorated_tools() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = test_runtime(tmp.path());
        if !runtime.is_available() {
            eprintln!("python3 unavailable; skipping");
            return;
        }
        let bundle = tmp.path().join("echo2");
        write_bundle(&bundle, ECHO_BUNDLE);

        let report = runtime.probe(&bundle).await.unwrap();
        assert!(report.ok, "{:?}", report.error);
        assert_eq!(report.tools.len(), 2);
        let echo = report.tools.iter().find(|t| t.name == "echo2").unwrap();
        assert_eq!(echo.description, "Echo a message back");
        assert_eq!(echo.parameters["m"]["type"], "str");
        assert_eq!(echo.parameters["m"]["required"], true);
    }

    #[tokio::test]
    async fn probe_reports_syntax_error_with_line() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = test_runtime(tmp.path());
        if !runtime.is_available() {
            eprintln!("python3 unavailable; skipping");
            return;
        }
        let bundle = tmp.path().join("broken");
        write_bundle(&bundle, "def broken(:\n    pass\n");

        let report = runtime.probe(&bundle).await.unwrap();
        assert!(!report.ok);
        assert_eq!(report.line, Some(1));
    }

    #[tokio::test]
    async fn invoke_returns_and_raises() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = test_runtime(tmp.path());
        if !runtime.is_available() {
            eprintln!("python3 unavailable; skipping");
            return;
        }
        let bundle = tmp.path().join("echo2");
        write_bundle(&bundle, ECHO_BUNDLE);

        let returned = runtime
            .invoke(&bundle, "echo2", &json!({"m": "x"}), Duration::from_secs(20))
            .await
            .unwrap();
        match returned {
            InvokeReport::Returned(value) => assert_eq!(value, json!({"echoed": "x"})),
            other => panic!("expected Returned, got {:?}", other),
        }

        let raised = runtime
            .invoke(&bundle, "always_fails", &json!({"m": "y"}), Duration::from_secs(20))
            .await
            .unwrap();
        match raised {
            InvokeReport::Raised(msg) => assert!(msg.contains("nope: y")),
            other => panic!("expected Raised, got {:?}", other),
        }

        let missing = runtime
            .invoke(&bundle, "ghost", &json!({}), Duration::from_secs(20))
            .await
            .unwrap();
        assert!(matches!(missing, InvokeReport::Fatal(_)));
    }

    #[tokio::test]
    async fn syntax_driver_verdicts() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = test_runtime(tmp.path());
        if !runtime.is_available() {
            eprintln!("python3 unavailable; skipping");
            return;
        }
        let good = runtime.check_syntax("x = 1\n").await.unwrap();
        assert!(good.ok);
        let bad = runtime.check_syntax("def f(:\n").await.unwrap();
        assert!(!bad.ok);
        assert_eq!(bad.line, Some(1));
    }
}

//! Out-of-process tool servers behind the invoker seam.
//!
//! Both transports speak one JSON object per invocation:
//! `{"tool": name, "arguments": {...}}` out, the tool's JSON result back.

use crate::tools::ToolInvoker;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const STDIO_TIMEOUT: Duration = Duration::from_secs(55);

/// Tool served over HTTP POST.
pub struct RemoteHttpInvoker {
    endpoint: String,
    tool_name: String,
    client: reqwest::Client,
}

impl RemoteHttpInvoker {
    pub fn new(endpoint: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tool_name: tool_name.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(55))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ToolInvoker for RemoteHttpInvoker {
    async fn invoke(&self, arguments: Value) -> Result<Value> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({"tool": self.tool_name, "arguments": arguments}))
            .send()
            .await
            .with_context(|| format!("tool server {} unreachable", self.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("tool server returned {}: {:.200}", status, body));
        }
        response.json().await.context("tool server returned non-JSON")
    }
}

/// Tool served by a subprocess: one request line on stdin, one response
/// line on stdout, then the process exits.
pub struct RemoteStdioInvoker {
    command: String,
    args: Vec<String>,
    tool_name: String,
}

impl RemoteStdioInvoker {
    pub fn new(command: impl Into<String>, args: Vec<String>, tool_name: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args,
            tool_name: tool_name.into(),
        }
    }
}

#[async_trait]
impl ToolInvoker for RemoteStdioInvoker {
    async fn invoke(&self, arguments: Value) -> Result<Value> {
        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("cannot spawn tool server {}", self.command))?;

        let request = serde_json::to_string(&json!({"tool": self.tool_name, "arguments": arguments}))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            drop(stdin);
        }

        let stdout = child.stdout.take().context("tool server has no stdout")?;
        let mut lines = BufReader::new(stdout).lines();
        let line = tokio::time::timeout(STDIO_TIMEOUT, lines.next_line())
            .await
            .map_err(|_| anyhow!("tool server {} timed out", self.command))??
            .ok_or_else(|| anyhow!("tool server {} closed without a response", self.command))?;
        let _ = child.wait().await;

        serde_json::from_str(&line).context("tool server returned non-JSON")
    }
}

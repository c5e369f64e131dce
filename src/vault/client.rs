//! Async client for the vault daemon socket.

use crate::vault::crypto::MARKER_PATTERN;
use crate::vault::{MAX_MESSAGE_SIZE, VaultRequest, VaultResponse};
use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

const CONNECT_RETRIES: u32 = 3;
const CONNECT_DELAY: Duration = Duration::from_millis(500);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// One-request-per-connection client for the vault wire protocol.
#[derive(Clone)]
pub struct VaultClient {
    socket_path: PathBuf,
}

impl VaultClient {
    pub fn new(vault_dir: &Path) -> Self {
        Self {
            socket_path: vault_dir.join("vault.sock"),
        }
    }

    async fn send(&self, request: &VaultRequest) -> Result<VaultResponse> {
        let mut last_error = None;
        for attempt in 1..=CONNECT_RETRIES {
            match UnixStream::connect(&self.socket_path).await {
                Ok(mut stream) => {
                    stream.write_all(serde_json::to_string(request)?.as_bytes()).await?;
                    stream.shutdown().await?;

                    let mut buf = Vec::new();
                    tokio::time::timeout(
                        READ_TIMEOUT,
                        (&mut stream).take(MAX_MESSAGE_SIZE as u64).read_to_end(&mut buf),
                    )
                    .await
                    .context("vault response timed out")??;
                    if buf.is_empty() {
                        return Err(anyhow!("empty response from vault daemon"));
                    }
                    return serde_json::from_slice(&buf).context("malformed vault response");
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < CONNECT_RETRIES {
                        debug!(attempt, "vault connect retry");
                        tokio::time::sleep(CONNECT_DELAY * attempt).await;
                    }
                }
            }
        }
        Err(anyhow!(
            "cannot reach vault daemon at {} after {} attempts: {:?}",
            self.socket_path.display(),
            CONNECT_RETRIES,
            last_error
        ))
    }

    async fn op(&self, op: &str, data: &str) -> Result<VaultResponse> {
        self.send(&VaultRequest {
            op: op.to_string(),
            data: data.to_string(),
            request_id: Some(uuid::Uuid::now_v7().to_string()),
        })
        .await
    }

    pub async fn encrypt(&self, plaintext: &str) -> Result<String> {
        let resp = self.op("encrypt", plaintext).await?;
        if !resp.ok {
            return Err(anyhow!("encrypt failed: {}", resp.error.unwrap_or_default()));
        }
        resp.data
            .and_then(|d| d.as_str().map(str::to_string))
            .ok_or_else(|| anyhow!("encrypt returned no marker"))
    }

    pub async fn decrypt(&self, marker: &str) -> Result<String> {
        let resp = self.op("decrypt", marker).await?;
        if !resp.ok {
            return Err(anyhow!("decrypt failed: {}", resp.error.unwrap_or_default()));
        }
        resp.data
            .and_then(|d| d.as_str().map(str::to_string))
            .ok_or_else(|| anyhow!("decrypt returned no plaintext"))
    }

    /// Replace every vault marker substring in `text` with its plaintext.
    /// Markers that fail to decrypt stay intact.
    pub async fn decrypt_all(&self, text: &str) -> String {
        let markers: Vec<String> = MARKER_PATTERN
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect();
        if markers.is_empty() {
            return text.to_string();
        }

        let mut result = text.to_string();
        for marker in markers {
            match self.decrypt(&marker).await {
                Ok(plaintext) => result = result.replace(&marker, &plaintext),
                Err(e) => warn!(marker = &marker[..30.min(marker.len())], error = %e, "marker decrypt failed, keeping ciphertext"),
            }
        }
        result
    }

    pub async fn setup(&self, password: &str) -> Result<bool> {
        let resp = self.op("setup", password).await?;
        if resp.ok {
            info!("vault setup succeeded");
        } else {
            warn!(error = resp.error.as_deref().unwrap_or(""), "vault setup failed");
        }
        Ok(resp.ok)
    }

    pub async fn unlock(&self, password: &str) -> Result<bool> {
        let resp = self.op("unlock", password).await?;
        if resp.ok {
            info!("vault unlocked");
        } else {
            warn!(error = resp.error.as_deref().unwrap_or(""), "vault unlock failed");
        }
        Ok(resp.ok)
    }

    pub async fn lock(&self) -> Result<bool> {
        Ok(self.op("lock", "").await?.ok)
    }

    /// `{"status": "needs_setup"|"locked"|"unlocked", ...}`. An unreachable
    /// daemon reads as `unknown`.
    pub async fn status(&self) -> Value {
        match self.op("status", "").await {
            Ok(resp) if resp.ok => resp.data.unwrap_or_else(|| serde_json::json!({"status": "unknown"})),
            Ok(resp) => serde_json::json!({"status": "unknown", "error": resp.error}),
            Err(e) => serde_json::json!({"status": "unknown", "error": e.to_string()}),
        }
    }

    pub async fn is_unlocked(&self) -> bool {
        self.status().await["status"] == "unlocked"
    }
}

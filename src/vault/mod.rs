//! Out-of-process secret vault.
//!
//! A separate daemon process owns the master key and serves encrypt/decrypt
//! over a Unix stream socket so the model never sees plaintext secrets at
//! rest. One JSON object per connection in each direction, 1 MiB cap.

pub mod client;
pub mod crypto;
pub mod daemon;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

pub use client::VaultClient;
pub use crypto::{MARKER_PATTERN, decrypt_data, derive_key, encrypt_data, find_markers, has_marker};
pub use daemon::VaultDaemon;

/// Max wire message size in either direction.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultRequest {
    pub op: String,
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl VaultResponse {
    pub fn ok_with(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            request_id: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            request_id: None,
        }
    }
}

/// Spawn the vault daemon as a child process (this binary re-invoked with
/// the hidden `vault-daemon` subcommand).
pub fn spawn_daemon(vault_dir: &Path) -> anyhow::Result<tokio::process::Child> {
    let exe = std::env::current_exe()?;
    let child = tokio::process::Command::new(exe)
        .arg("vault-daemon")
        .arg("--dir")
        .arg(vault_dir)
        .spawn()?;
    info!(pid = child.id(), dir = %vault_dir.display(), "vault daemon spawned");
    Ok(child)
}

/// Terminate the daemon: SIGTERM, 5 s grace, then SIGKILL.
pub async fn stop_daemon(mut child: tokio::process::Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain signal send to a child we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(_) => {
                info!(pid, "vault daemon exited");
                return;
            }
            Err(_) => warn!(pid, "vault daemon did not exit in time, killing"),
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

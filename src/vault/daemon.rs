//! Vault daemon: Unix-socket server owning the master key.

use crate::vault::crypto::{AES_KEY_LEN, MasterKeyFile, decrypt_data, encrypt_data};
use crate::vault::{MAX_MESSAGE_SIZE, VaultRequest, VaultResponse};
use anyhow::{Context, Result};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

const MAX_ATTEMPTS: u32 = 5;
const LOCKOUT: Duration = Duration::from_secs(300);
const MIN_PASSWORD_LEN: usize = 4;

struct KeyState {
    master_key: Option<Zeroizing<[u8; AES_KEY_LEN]>>,
    failed_attempts: u32,
    locked_until: Option<Instant>,
}

/// The vault daemon. Runs in its own process; all key-state operations are
/// serialized through a single mutex while each connection gets its own task.
pub struct VaultDaemon {
    socket_path: PathBuf,
    vault_dir: PathBuf,
    key_file: MasterKeyFile,
    state: Arc<Mutex<KeyState>>,
}

impl VaultDaemon {
    pub fn new(vault_dir: PathBuf) -> Self {
        let key_file = MasterKeyFile::new(vault_dir.join("master.key"));
        Self {
            socket_path: vault_dir.join("vault.sock"),
            vault_dir,
            key_file,
            state: Arc::new(Mutex::new(KeyState {
                master_key: None,
                failed_attempts: 0,
                locked_until: None,
            })),
        }
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// Serve until SIGTERM/SIGINT. The key is wiped before returning.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        std::fs::create_dir_all(&self.vault_dir)?;
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .with_context(|| format!("failed to unlink stale socket {}", self.socket_path.display()))?;
        }
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("failed to bind {}", self.socket_path.display()))?;
        restrict_socket(&self.socket_path)?;

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        let status = self.status_label().await;
        info!(socket = %self.socket_path.display(), status, "vault daemon started");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let daemon = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = daemon.handle_connection(stream).await {
                                    error!(error = %e, "vault connection error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "vault accept failed"),
                    }
                }
                _ = sigterm.recv() => break,
                _ = sigint.recv() => break,
            }
        }

        self.state.lock().await.master_key = None;
        let _ = std::fs::remove_file(&self.socket_path);
        info!("vault daemon stopped");
        Ok(())
    }

    async fn status_label(&self) -> &'static str {
        if !self.key_file.is_readable() {
            return "needs_setup";
        }
        if self.state.lock().await.master_key.is_none() {
            "locked"
        } else {
            "unlocked"
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_SIZE as u64)
            .read_to_end(&mut buf)
            .await?;
        if buf.is_empty() {
            return Ok(());
        }

        let response = match serde_json::from_slice::<VaultRequest>(&buf) {
            Ok(request) => {
                let request_id = request.request_id.clone();
                let mut resp = self.dispatch(request).await;
                resp.request_id = request_id;
                resp
            }
            Err(_) => VaultResponse::err("invalid JSON request"),
        };

        stream.write_all(serde_json::to_string(&response)?.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn dispatch(&self, request: VaultRequest) -> VaultResponse {
        match request.op.as_str() {
            "setup" => self.handle_setup(&request.data).await,
            "unlock" => self.handle_unlock(&request.data).await,
            "encrypt" => self.handle_encrypt(&request.data).await,
            "decrypt" => self.handle_decrypt(&request.data).await,
            "status" => self.handle_status().await,
            "lock" => self.handle_lock().await,
            other => VaultResponse::err(format!("unknown operation: {}", other)),
        }
    }

    async fn handle_setup(&self, password: &str) -> VaultResponse {
        if self.key_file.is_readable() {
            return VaultResponse::err("master key already exists; use unlock");
        }
        if password.len() < MIN_PASSWORD_LEN {
            return VaultResponse::err(format!("password must be at least {} characters", MIN_PASSWORD_LEN));
        }
        match self.key_file.create(password) {
            Ok(key) => {
                let mut state = self.state.lock().await;
                state.master_key = Some(key);
                state.failed_attempts = 0;
                info!("vault setup complete");
                VaultResponse::ok_with(json!("setup_complete"))
            }
            Err(e) => VaultResponse::err(format!("setup failed: {}", e)),
        }
    }

    async fn handle_unlock(&self, password: &str) -> VaultResponse {
        let mut state = self.state.lock().await;
        if state.master_key.is_some() {
            return VaultResponse::ok_with(json!("already_unlocked"));
        }
        if !self.key_file.is_readable() {
            return VaultResponse::err("no master key; run setup first");
        }

        let now = Instant::now();
        if let Some(until) = state.locked_until {
            if now < until {
                let remaining = (until - now).as_secs();
                return VaultResponse::err(format!("lockout: retry in {}s", remaining));
            }
            state.locked_until = None;
        }

        match self.key_file.unlock(password) {
            Ok(key) => {
                state.master_key = Some(key);
                state.failed_attempts = 0;
                info!("vault unlocked");
                VaultResponse::ok_with(json!("unlocked"))
            }
            Err(_) => {
                state.failed_attempts += 1;
                warn!(attempts = state.failed_attempts, "vault unlock failed");
                if state.failed_attempts >= MAX_ATTEMPTS {
                    state.locked_until = Some(now + LOCKOUT);
                    state.failed_attempts = 0;
                    return VaultResponse::err(format!(
                        "{} failed attempts; locked out for {}s",
                        MAX_ATTEMPTS,
                        LOCKOUT.as_secs()
                    ));
                }
                VaultResponse::err(format!(
                    "wrong password; {} attempts remaining",
                    MAX_ATTEMPTS - state.failed_attempts
                ))
            }
        }
    }

    async fn handle_encrypt(&self, plaintext: &str) -> VaultResponse {
        let state = self.state.lock().await;
        let Some(ref key) = state.master_key else {
            return VaultResponse::err("vault is locked; unlock first");
        };
        match encrypt_data(plaintext, key) {
            Ok(marker) => VaultResponse::ok_with(json!(marker)),
            Err(e) => VaultResponse::err(format!("encrypt failed: {}", e)),
        }
    }

    async fn handle_decrypt(&self, marker: &str) -> VaultResponse {
        let state = self.state.lock().await;
        let Some(ref key) = state.master_key else {
            return VaultResponse::err("vault is locked; unlock first");
        };
        match decrypt_data(marker, key) {
            Ok(plaintext) => VaultResponse::ok_with(json!(plaintext)),
            Err(e) => VaultResponse::err(format!("decrypt failed: {}", e)),
        }
    }

    async fn handle_status(&self) -> VaultResponse {
        VaultResponse::ok_with(json!({
            "status": self.status_label().await,
            "master_key_exists": self.key_file.is_readable(),
            "created_at": self.key_file.created_at(),
        }))
    }

    async fn handle_lock(&self) -> VaultResponse {
        self.state.lock().await.master_key = None;
        info!("vault locked");
        VaultResponse::ok_with(json!("locked"))
    }
}

#[cfg(unix)]
fn restrict_socket(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daemon() -> (tempfile::TempDir, Arc<VaultDaemon>) {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Arc::new(VaultDaemon::new(dir.path().to_path_buf()));
        (dir, daemon)
    }

    #[tokio::test]
    async fn fresh_daemon_needs_setup() {
        let (_dir, d) = daemon();
        let resp = d.handle_status().await;
        assert!(resp.ok);
        assert_eq!(resp.data.unwrap()["status"], "needs_setup");
    }

    #[tokio::test]
    async fn setup_then_encrypt_decrypt() {
        let (_dir, d) = daemon();
        assert!(d.handle_setup("correct horse").await.ok);

        let enc = d.handle_encrypt("api key sk-test").await;
        assert!(enc.ok);
        let marker = enc.data.unwrap().as_str().unwrap().to_string();
        assert!(marker.starts_with("[[SECDATA:AES256GCM:"));

        let dec = d.handle_decrypt(&marker).await;
        assert!(dec.ok);
        assert_eq!(dec.data.unwrap(), "api key sk-test");
    }

    #[tokio::test]
    async fn short_password_rejected() {
        let (_dir, d) = daemon();
        let resp = d.handle_setup("abc").await;
        assert!(!resp.ok);
    }

    #[tokio::test]
    async fn operations_while_locked_error_cleanly() {
        let (_dir, d) = daemon();
        d.handle_setup("password").await;
        d.handle_lock().await;

        let enc = d.handle_encrypt("x").await;
        assert!(!enc.ok);
        assert!(enc.error.unwrap().contains("locked"));
        let dec = d.handle_decrypt("[[SECDATA:AES256GCM:a:b:c]]").await;
        assert!(!dec.ok);
    }

    #[tokio::test]
    async fn lockout_after_five_failures() {
        let (_dir, d) = daemon();
        d.handle_setup("password").await;
        d.handle_lock().await;

        for _ in 0..4 {
            let resp = d.handle_unlock("nope").await;
            assert!(!resp.ok);
            assert!(resp.error.unwrap().contains("attempts remaining"));
        }
        let fifth = d.handle_unlock("nope").await;
        assert!(!fifth.ok);
        assert!(fifth.error.unwrap().contains("locked out"));

        // even the correct password is rejected during lockout
        let sixth = d.handle_unlock("password").await;
        assert!(!sixth.ok);
        assert!(sixth.error.unwrap().contains("lockout"));
    }

    #[tokio::test]
    async fn successful_unlock_clears_counter() {
        let (_dir, d) = daemon();
        d.handle_setup("password").await;
        d.handle_lock().await;

        for _ in 0..3 {
            assert!(!d.handle_unlock("nope").await.ok);
        }
        assert!(d.handle_unlock("password").await.ok);
        d.handle_lock().await;
        // counter was reset; four more failures still give "attempts remaining"
        for _ in 0..4 {
            let resp = d.handle_unlock("nope").await;
            assert!(resp.error.unwrap().contains("attempts remaining"));
        }
    }

    #[tokio::test]
    async fn corrupted_key_file_reports_needs_setup() {
        let (dir, d) = daemon();
        std::fs::write(dir.path().join("master.key"), "garbage").unwrap();
        let resp = d.handle_status().await;
        assert_eq!(resp.data.unwrap()["status"], "needs_setup");
    }

    #[tokio::test]
    async fn unknown_op_rejected() {
        let (_dir, d) = daemon();
        let resp = d
            .dispatch(VaultRequest {
                op: "explode".into(),
                data: String::new(),
                request_id: None,
            })
            .await;
        assert!(!resp.ok);
        assert!(resp.error.unwrap().contains("unknown operation"));
    }
}

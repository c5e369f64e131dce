//! Argon2id key derivation and AES-256-GCM encryption behind the vault
//! marker format.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result, anyhow};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;
use zeroize::Zeroizing;

pub const AES_KEY_LEN: usize = 32;
pub const AES_NONCE_LEN: usize = 12;
pub const AES_TAG_LEN: usize = 16;
const SALT_LEN: usize = 32;

// Argon2id parameters: memory-hard enough for an interactive unlock.
const ARGON2_TIME_COST: u32 = 3;
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_PARALLELISM: u32 = 4;

/// Marker shape: `[[SECDATA:AES256GCM:<nonce>:<ciphertext>:<tag>]]`,
/// three base64 fields.
pub static MARKER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[SECDATA:AES256GCM:([A-Za-z0-9+/=]+):([A-Za-z0-9+/=]+):([A-Za-z0-9+/=]+)\]\]")
        .expect("marker pattern compiles")
});

fn argon2() -> Result<Argon2<'static>> {
    let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_TIME_COST, ARGON2_PARALLELISM, Some(AES_KEY_LEN))
        .map_err(|e| anyhow!("argon2 params: {}", e))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Derive a 32-byte key-encryption key from a password and salt.
pub fn derive_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; AES_KEY_LEN]>> {
    let mut out = Zeroizing::new([0u8; AES_KEY_LEN]);
    argon2()?
        .hash_password_into(password.as_bytes(), salt, &mut out[..])
        .map_err(|e| anyhow!("key derivation failed: {}", e))?;
    Ok(out)
}

/// Encrypt plaintext under the master key and return the full marker literal.
/// A fresh random 96-bit nonce is drawn per message.
pub fn encrypt_data(plaintext: &str, key: &[u8; AES_KEY_LEN]) -> Result<String> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce = [0u8; AES_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ct_with_tag = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| anyhow!("encryption failed"))?;
    let split = ct_with_tag.len() - AES_TAG_LEN;
    let (ciphertext, tag) = ct_with_tag.split_at(split);
    Ok(format!(
        "[[SECDATA:AES256GCM:{}:{}:{}]]",
        B64.encode(nonce),
        B64.encode(ciphertext),
        B64.encode(tag)
    ))
}

/// Decrypt a marker literal. The input must be exactly one marker.
pub fn decrypt_data(marker: &str, key: &[u8; AES_KEY_LEN]) -> Result<String> {
    let caps = MARKER_PATTERN
        .captures(marker)
        .filter(|c| c.get(0).map(|m| m.as_str()) == Some(marker))
        .ok_or_else(|| anyhow!("invalid vault marker: {:.50}", marker))?;
    let nonce = B64.decode(&caps[1]).context("bad nonce encoding")?;
    let ciphertext = B64.decode(&caps[2]).context("bad ciphertext encoding")?;
    let tag = B64.decode(&caps[3]).context("bad tag encoding")?;
    if nonce.len() != AES_NONCE_LEN {
        return Err(anyhow!("bad nonce length: {}", nonce.len()));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut ct_with_tag = ciphertext;
    ct_with_tag.extend_from_slice(&tag);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ct_with_tag.as_slice())
        .map_err(|_| anyhow!("decryption failed: wrong key or tampered data"))?;
    String::from_utf8(plaintext).context("decrypted payload is not UTF-8")
}

/// All marker substrings in `text`, as `(start, end, literal)` spans.
pub fn find_markers(text: &str) -> Vec<(usize, usize, String)> {
    MARKER_PATTERN
        .find_iter(text)
        .map(|m| (m.start(), m.end(), m.as_str().to_string()))
        .collect()
}

pub fn has_marker(text: &str) -> bool {
    MARKER_PATTERN.is_match(text)
}

/// On-disk record protecting the master key.
#[derive(Debug, Serialize, Deserialize)]
struct MasterKeyRecord {
    version: u32,
    algorithm: String,
    salt: String,
    nonce: String,
    encrypted_master_key: String,
    created_at: String,
}

/// The master-key file: a random data-encryption key wrapped by an
/// Argon2id-derived KEK and stored with mode 0600.
pub struct MasterKeyFile {
    path: PathBuf,
}

impl MasterKeyFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Whether the file exists and parses. A present-but-corrupt file reads
    /// as absent so the caller can report `needs_setup`.
    pub fn is_readable(&self) -> bool {
        self.read_record().is_ok()
    }

    fn read_record(&self) -> Result<MasterKeyRecord> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read master key file {}", self.path.display()))?;
        serde_json::from_str(&content).context("master key file is corrupted")
    }

    /// Generate a fresh master key, wrap it under the password, and persist.
    pub fn create(&self, password: &str) -> Result<Zeroizing<[u8; AES_KEY_LEN]>> {
        let mut master_key = Zeroizing::new([0u8; AES_KEY_LEN]);
        OsRng.fill_bytes(&mut master_key[..]);

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let kek = derive_key(password, &salt)?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek[..]));
        let mut nonce = [0u8; AES_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let encrypted_mk = cipher
            .encrypt(Nonce::from_slice(&nonce), &master_key[..])
            .map_err(|_| anyhow!("master key wrap failed"))?;

        let record = MasterKeyRecord {
            version: 1,
            algorithm: "argon2id".to_string(),
            salt: B64.encode(salt),
            nonce: B64.encode(nonce),
            encrypted_master_key: B64.encode(&encrypted_mk),
            created_at: Utc::now().to_rfc3339(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&record)?)?;
        restrict_permissions(&self.path)?;
        tracing::info!(path = %self.path.display(), "master key created");
        Ok(master_key)
    }

    /// Unwrap the master key with the password. Wrong password fails the
    /// GCM tag check.
    pub fn unlock(&self, password: &str) -> Result<Zeroizing<[u8; AES_KEY_LEN]>> {
        let record = self.read_record()?;
        let salt = B64.decode(&record.salt).context("bad salt encoding")?;
        let nonce = B64.decode(&record.nonce).context("bad nonce encoding")?;
        let encrypted_mk = B64
            .decode(&record.encrypted_master_key)
            .context("bad key encoding")?;

        let kek = derive_key(password, &salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek[..]));
        let plain = cipher
            .decrypt(Nonce::from_slice(&nonce), encrypted_mk.as_slice())
            .map_err(|_| anyhow!("wrong password"))?;
        let mut master_key = Zeroizing::new([0u8; AES_KEY_LEN]);
        if plain.len() != AES_KEY_LEN {
            return Err(anyhow!("unexpected master key length"));
        }
        master_key[..].copy_from_slice(&plain);
        Ok(master_key)
    }

    pub fn created_at(&self) -> Option<String> {
        self.read_record().ok().map(|r| r.created_at)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

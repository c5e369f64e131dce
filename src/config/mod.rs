use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Security
// ---------------------------------------------------------------------------

fn default_rate_limit() -> usize {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Allow-list of tool names. Empty means "allow all not explicitly denied".
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Deny-list of tool names. Always wins over the allow-list.
    #[serde(default)]
    pub blocked_tools: Vec<String>,
    /// Per-user tool-call cap inside a sliding 60-second window.
    #[serde(default = "default_rate_limit")]
    pub max_requests_per_minute: usize,
    /// Audit ring capacity.
    #[serde(default = "default_audit_entries")]
    pub audit_max_entries: usize,
}

fn default_audit_entries() -> usize {
    1000
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_tools: vec![],
            blocked_tools: vec![],
            max_requests_per_minute: default_rate_limit(),
            audit_max_entries: default_audit_entries(),
        }
    }
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

fn default_models() -> Vec<String> {
    vec![
        "gpt-5-mini".to_string(),
        "gemini/gemini-3-flash".to_string(),
        "claude-haiku-4-5".to_string(),
    ]
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_llm_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Process-wide fallback chain, tried in order.
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    /// Optional YAML file mapping roles to model chains.
    #[serde(default)]
    pub role_models_file: Option<PathBuf>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-request timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            models: default_models(),
            role_models_file: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout: default_llm_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Forge (skill synthesis)
// ---------------------------------------------------------------------------

fn default_max_retries() -> usize {
    3
}

fn default_python_bin() -> String {
    "python3".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Interpreter used to probe and run generated tool bundles.
    #[serde(default = "default_python_bin")]
    pub python_bin: String,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            python_bin: default_python_bin(),
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8790
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    /// Sender ids allowed to talk to the bot. Empty allows everyone.
    #[serde(default)]
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
}

// ---------------------------------------------------------------------------
// Agent / session
// ---------------------------------------------------------------------------

fn default_max_turns() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// User+assistant pairs kept per conversation buffer.
    #[serde(default = "default_max_turns")]
    pub max_history_turns: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_history_turns: default_max_turns(),
        }
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Data directory. Defaults to the platform data dir + "adjutant".
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub forge: ForgeConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("adjutant")
        })
    }

    pub fn vault_dir(&self) -> PathBuf {
        self.data_dir().join("secvault")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.data_dir().join("tools")
    }

    pub fn skill_context_socket(&self) -> PathBuf {
        self.data_dir().join("skill-context.sock")
    }

    pub fn sensitive_patterns_path(&self) -> PathBuf {
        self.data_dir().join("sensitive_patterns.yaml")
    }

    fn validate(&self) -> Result<()> {
        if self.security.max_requests_per_minute == 0 {
            anyhow::bail!("security.max_requests_per_minute must be > 0");
        }
        if self.llm.models.is_empty() {
            anyhow::bail!("llm.models must list at least one model");
        }
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("adjutant")
        .join("adjutant.toml")
}

/// Load the config from `path` (or the default location), then apply
/// environment overrides for credentials.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let default_path = default_config_path();
    let path = path.unwrap_or(default_path.as_path());

    let mut config = if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);
    config.validate().context("configuration validation failed")?;
    Ok(config)
}

/// Environment variables win over file values for credentials and paths.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN")
        && !token.is_empty()
    {
        config.channels.telegram.token = token;
        config.channels.telegram.enabled = true;
    }
    if let Ok(dir) = std::env::var("ADJUTANT_DATA_DIR")
        && !dir.is_empty()
    {
        config.data_dir = Some(PathBuf::from(dir));
    }
}

//! Process assembly: wires the vault, memory, router, registry, forge,
//! channels, and gateway together.

use crate::agent::AgentLoop;
use crate::channels::ChannelRuntime;
use crate::channels::telegram::TelegramChannel;
use crate::config::Config;
use crate::envelope::ChannelKind;
use crate::forge::{
    BundleLoader, ContextServer, ForgeCoordinator, PythonRuntime, SkillForge, SkillServices, SkillTester,
};
use crate::gateway::{GatewayState, serve};
use crate::llm::openai_compat::OpenAiCompatClient;
use crate::llm::prompts::PromptRegistry;
use crate::llm::router::ProviderKind;
use crate::llm::{LlmClient, LlmRouter};
use crate::memory::signal::{SensitiveDetector, write_default_patterns};
use crate::memory::{MarkdownMemoryEngine, MemoryCapture};
use crate::notify::NotificationHub;
use crate::security::{AuditLog, PolicyDecisionPoint};
use crate::session::ConversationCache;
use crate::tools::ToolRegistry;
use crate::tools::builtin::register_builtin_tools;
use crate::vault::{VaultClient, spawn_daemon, stop_daemon};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SHUTDOWN_RETAIN_GRACE: Duration = Duration::from_secs(10);

pub struct App {
    config: Config,
    runtime: Arc<ChannelRuntime>,
    coordinator: Arc<ForgeCoordinator>,
    notifier: Arc<NotificationHub>,
    vault_client: VaultClient,
    vault_child: Option<tokio::process::Child>,
    context_server: tokio::task::JoinHandle<()>,
}

impl App {
    pub async fn build(config: Config) -> Result<Self> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir).context("cannot create data dir")?;

        // vault process first: the capture layer consults it for every
        // sensitive span
        let vault_dir = config.vault_dir();
        let vault_child = match spawn_daemon(&vault_dir) {
            Ok(child) => Some(child),
            Err(e) => {
                warn!(error = %e, "vault daemon failed to start; secrets stay unencrypted");
                None
            }
        };
        let vault_client = VaultClient::new(&vault_dir);

        // memory stack
        let patterns_path = config.sensitive_patterns_path();
        if !patterns_path.exists() {
            if let Err(e) = write_default_patterns(&patterns_path) {
                warn!(error = %e, "could not write default sensitive patterns");
            }
        }
        let detector = SensitiveDetector::from_yaml(&patterns_path);
        let engine = Arc::new(MarkdownMemoryEngine::new(
            data_dir.join("memory"),
            SensitiveDetector::from_yaml(&patterns_path),
        )?);
        let memory = Arc::new(MemoryCapture::new(engine, Some(vault_client.clone()), detector));

        // LLM router over whichever providers have credentials
        let router = Arc::new(LlmRouter::new(&config.llm, credentialed_clients())?);

        // policy, audit, registry
        let pdp = Arc::new(PolicyDecisionPoint::new(&config.security));
        let audit = Arc::new(AuditLog::new(config.security.audit_max_entries));
        let registry = Arc::new(ToolRegistry::new(pdp.clone(), audit.clone()));

        // skill context service for generated tools
        let context_socket = config.skill_context_socket();
        let services = Arc::new(SkillServices::new(router.clone(), memory.clone()));
        crate::forge::context::initialize(services.clone());
        let context_server = {
            let server = Arc::new(ContextServer::new(context_socket.clone(), services));
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    warn!(error = %e, "skill context server stopped");
                }
            })
        };

        // forge
        let python = PythonRuntime::new(&config.forge.python_bin, &data_dir, Some(context_socket))?;
        let tools_root = config.tools_dir();
        let forge = Arc::new(SkillForge::new(
            router.clone(),
            memory.clone(),
            None,
            BundleLoader::new(python.clone()),
            SkillTester::new(python),
            tools_root.join("generated"),
            config.forge.max_retries,
        ));
        let notifier = Arc::new(NotificationHub::new());
        let coordinator = Arc::new(ForgeCoordinator::new(
            forge,
            registry.clone(),
            notifier.clone(),
            tools_root,
        ));

        register_builtin_tools(&registry, memory.clone(), coordinator.clone())?;
        let loaded = coordinator.load_existing().await;

        // conversation cache wired to catalog changes
        let sessions = Arc::new(ConversationCache::new(config.agent.max_history_turns));
        sessions.subscribe_to(&registry);
        // the boot-time loads above fired change events; start clean
        sessions.clear_all();

        let agent = AgentLoop::new(router, memory, registry, Arc::new(PromptRegistry::new()));
        let runtime = Arc::new(ChannelRuntime::new(agent, sessions, pdp, audit));

        info!(data_dir = %data_dir.display(), dynamic_tools = loaded, "adjutant assembled");
        Ok(Self {
            config,
            runtime,
            coordinator,
            notifier,
            vault_client,
            vault_child,
            context_server,
        })
    }

    pub fn runtime(&self) -> Arc<ChannelRuntime> {
        self.runtime.clone()
    }

    /// One blocking CLI turn.
    pub async fn one_shot(&self, message: &str) -> Result<String> {
        let mut envelope =
            self.runtime
                .receive(ChannelKind::Cli, "cli-user", "", message, HashMap::new());
        Ok(self.runtime.process(&mut envelope).await?)
    }

    /// Start channels and the gateway, then park until ctrl-c.
    pub async fn run_until_shutdown(mut self) -> Result<()> {
        if self.config.channels.telegram.enabled && !self.config.channels.telegram.token.is_empty() {
            let channel = TelegramChannel::new(self.config.channels.telegram.clone(), self.runtime.clone());
            self.notifier.subscribe(channel.notification_sink()).await;
            channel.start().await?;
        }

        let mut gateway = None;
        if self.config.gateway.enabled {
            let state = GatewayState {
                runtime: self.runtime.clone(),
                coordinator: self.coordinator.clone(),
                notifier: self.notifier.clone(),
                vault: Some(self.vault_client.clone()),
            };
            let host = self.config.gateway.host.clone();
            let port = self.config.gateway.port;
            gateway = Some(tokio::spawn(async move {
                if let Err(e) = serve(state, &host, port).await {
                    warn!(error = %e, "gateway stopped");
                }
            }));
        }

        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");

        if let Some(handle) = gateway {
            handle.abort();
        }
        self.shutdown().await;
        Ok(())
    }

    /// Orderly teardown: drain retains briefly, stop the context server,
    /// terminate the vault process.
    pub async fn shutdown(&mut self) {
        let retains = self.runtime.agent().retain_tracker();
        if tokio::time::timeout(SHUTDOWN_RETAIN_GRACE, retains.wait_all()).await.is_err() {
            warn!("background retains did not finish in time");
            retains.cancel_all().await;
        }
        self.context_server.abort();
        if let Some(child) = self.vault_child.take() {
            stop_daemon(child).await;
        }
        info!("adjutant stopped");
    }
}

/// One OpenAI-compatible client per provider with a credential present.
fn credentialed_clients() -> HashMap<ProviderKind, Arc<dyn LlmClient>> {
    let mut clients: HashMap<ProviderKind, Arc<dyn LlmClient>> = HashMap::new();
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if !key.is_empty() {
            clients.insert(ProviderKind::OpenAi, Arc::new(OpenAiCompatClient::openai(key)));
        }
    }
    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        if !key.is_empty() {
            clients.insert(ProviderKind::Gemini, Arc::new(OpenAiCompatClient::gemini(key)));
        }
    }
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        if !key.is_empty() {
            clients.insert(ProviderKind::Anthropic, Arc::new(OpenAiCompatClient::anthropic(key)));
        }
    }
    clients
}

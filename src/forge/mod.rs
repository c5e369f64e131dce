//! Dynamic tool synthesis ("the forge") and skill lifecycle management.

pub mod context;
pub mod generator;
pub mod loader;
pub mod python;
pub mod safety;
pub mod tester;

pub use context::{ContextServer, SkillServices};
pub use generator::{ForgeOutcome, SkillForge};
pub use loader::BundleLoader;
pub use python::PythonRuntime;
pub use safety::CodeSafetyChecker;
pub use tester::SkillTester;

use crate::notify::NotificationHub;
use crate::tools::ToolRegistry;
use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Drives skill generation off the turn path and owns bundle lifecycle
/// (boot loading, listing, deletion, toggling).
///
/// A single boolean guards against two synthesis runs racing; a second
/// `create_skill` while one is in flight is rejected at the dispatch site.
pub struct ForgeCoordinator {
    forge: Arc<SkillForge>,
    registry: Arc<ToolRegistry>,
    notifier: Arc<NotificationHub>,
    tools_root: PathBuf,
    generating: AtomicBool,
    /// bundle dir name → tool names it registered
    bundle_tools: Mutex<HashMap<String, Vec<String>>>,
}

impl ForgeCoordinator {
    pub fn new(
        forge: Arc<SkillForge>,
        registry: Arc<ToolRegistry>,
        notifier: Arc<NotificationHub>,
        tools_root: PathBuf,
    ) -> Self {
        Self {
            forge,
            registry,
            notifier,
            tools_root,
            generating: AtomicBool::new(false),
            bundle_tools: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    pub fn forge(&self) -> Arc<SkillForge> {
        self.forge.clone()
    }

    /// Entry point for the `create_skill` tool. Returns immediately; the
    /// pipeline runs in the background and notifies every channel when it
    /// finishes.
    pub fn request_skill(self: &Arc<Self>, description: String) -> Value {
        if self.generating.swap(true, Ordering::SeqCst) {
            warn!(description, "skill creation blocked: one already in flight");
            return json!({
                "status": "already_generating",
                "message": "a skill is already being generated; try again when it finishes",
            });
        }

        let coordinator = Arc::clone(self);
        let request = description.clone();
        tokio::spawn(async move {
            coordinator.run_generation(request).await;
        });

        json!({
            "status": "generating",
            "message": format!("generating a skill for {:?} in the background; it will be announced when ready", description),
        })
    }

    async fn run_generation(self: Arc<Self>, request: String) {
        let outcome = self.forge.generate(&request).await;
        if outcome.success {
            match self.activate_bundle(&outcome.bundle_dir).await {
                Ok(names) => {
                    info!(tool_name = %outcome.tool_name, tools = names.len(), "skill hot-loaded");
                    self.notifier
                        .broadcast("skill_created", &format!("'{}' is ready", outcome.tool_name))
                        .await;
                }
                Err(e) => {
                    error!(tool_name = %outcome.tool_name, error = %e, "generated skill failed to activate");
                    self.notifier
                        .broadcast("skill_error", &format!("skill generation hit an error: {}", e))
                        .await;
                }
            }
        } else {
            warn!(request, error = %outcome.last_error, "skill generation exhausted retries");
            self.notifier
                .broadcast(
                    "skill_failed",
                    &format!("skill generation for {:?} failed; try rephrasing the request", request),
                )
                .await;
        }
        self.generating.store(false, Ordering::SeqCst);
    }

    /// Load one bundle dir and (re)register its tools. Registering emits
    /// catalog change events, which clears every conversation buffer.
    pub async fn activate_bundle(&self, dir: &Path) -> Result<Vec<String>> {
        let tools = self.forge.loader().load_bundle(dir).await?;
        let descriptors = self.forge.loader().descriptors(dir, &tools);
        let mut names = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            // a regenerated bundle replaces its previous tools
            if self.registry.contains(&name) {
                self.registry.remove(&name);
            }
            self.registry.register(descriptor)?;
            names.push(name);
        }
        let bundle_name = dir.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string();
        self.bundle_tools.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(bundle_name, names.clone());
        Ok(names)
    }

    /// Boot-time activation of every enabled bundle under the tools root.
    pub async fn load_existing(&self) -> usize {
        let mut loaded = 0;
        for dir in BundleLoader::scan(&self.tools_root) {
            match self.activate_bundle(&dir).await {
                Ok(names) => loaded += names.len(),
                Err(e) => warn!(dir = %dir.display(), error = %e, "bundle skipped at boot"),
            }
        }
        if loaded > 0 {
            info!(tools = loaded, "existing skills loaded");
        }
        loaded
    }

    /// Listing for the management surface, disabled bundles included.
    pub fn list_skills(&self) -> Value {
        let mut skills = Vec::new();
        for base in [self.tools_root.clone(), self.tools_root.join("generated")] {
            let Ok(entries) = std::fs::read_dir(&base) else {
                continue;
            };
            let auto_generated_dir = base.ends_with("generated");
            let mut dirs: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_dir() && p.join("tool.py").exists())
                .collect();
            dirs.sort();
            for dir in dirs {
                let name = dir.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string();
                if name.starts_with('.') || name.starts_with("__") {
                    continue;
                }
                let meta = BundleLoader::load_meta(&dir).unwrap_or_default();
                skills.push(json!({
                    "name": if meta.name.is_empty() { name.clone() } else { meta.name.clone() },
                    "category": if auto_generated_dir { "generated" } else { "custom" },
                    "path": dir.display().to_string(),
                    "enabled": !dir.join(".disabled").exists(),
                    "auto_generated": meta.auto_generated || auto_generated_dir,
                    "description": meta.description,
                    "version": if meta.version.is_empty() { "1.0.0".to_string() } else { meta.version },
                    "tags": meta.tags,
                }));
            }
        }
        let active = skills.iter().filter(|s| s["enabled"] == true).count();
        let total = skills.len();
        json!({"skills": skills, "total": total, "active": active})
    }

    /// Delete an auto-generated bundle: unregister its tools, remove the
    /// directory, and record the deletion in the skill bank so it is not
    /// recreated.
    pub async fn delete_skill(&self, name: &str) -> Result<Value> {
        if !crate::tools::is_valid_tool_name(name) {
            return Err(anyhow!("invalid skill name"));
        }
        let dir = self.tools_root.join("generated").join(name);
        let resolved = dir.canonicalize().map_err(|_| anyhow!("skill '{}' not found", name))?;
        let root = self
            .tools_root
            .join("generated")
            .canonicalize()
            .map_err(|_| anyhow!("skill '{}' not found", name))?;
        if !resolved.starts_with(&root) {
            return Err(anyhow!("path not allowed"));
        }

        let description = BundleLoader::load_meta(&dir).map(|m| m.description).unwrap_or_default();

        let tool_names = self
            .bundle_tools
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name)
            .unwrap_or_else(|| vec![name.to_string()]);
        for tool in &tool_names {
            self.registry.remove(tool);
        }

        std::fs::remove_dir_all(&resolved)?;
        info!(name, "skill deleted");
        self.forge.record_deletion(name, &description).await;
        Ok(json!({"status": "deleted", "name": name}))
    }

    /// Flip the `.disabled` sentinel. Disabling withdraws the bundle's tools
    /// from the published catalog; enabling re-activates the bundle.
    pub async fn toggle_skill(&self, name: &str) -> Result<Value> {
        let dir = self.find_bundle(name).ok_or_else(|| anyhow!("skill '{}' not found", name))?;
        let sentinel = dir.join(".disabled");
        let enabled = if sentinel.exists() {
            std::fs::remove_file(&sentinel)?;
            self.activate_bundle(&dir).await?;
            true
        } else {
            std::fs::write(&sentinel, "")?;
            let tool_names = self
                .bundle_tools
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(name)
                .cloned()
                .unwrap_or_else(|| vec![name.to_string()]);
            for tool in &tool_names {
                self.registry.set_enabled(tool, false);
            }
            false
        };
        info!(name, enabled, "skill toggled");
        Ok(json!({"name": name, "enabled": enabled}))
    }

    fn find_bundle(&self, name: &str) -> Option<PathBuf> {
        for base in [self.tools_root.join("generated"), self.tools_root.clone()] {
            let dir = base.join(name);
            if dir.join("tool.py").exists() {
                return Some(dir);
            }
        }
        None
    }
}

//! Identity and purpose prompts.

use std::collections::HashMap;
use std::sync::RwLock;

/// The assistant's standing identity, prepended to every reason step.
pub const IDENTITY_PROMPT: &str = "\
You are Adjutant, a personal AI assistant. You remember what the user tells \
you through your memory tools and you answer in the user's language (Korean \
messages get Korean answers). Be concise and direct. When the user asks for \
a capability you lack, you may request a new skill with the create_skill \
tool — call it once and tell the user generation runs in the background.";

/// Small registry mapping a purpose label to a prompt, replaceable at
/// runtime.
pub struct PromptRegistry {
    prompts: RwLock<HashMap<String, String>>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        let mut prompts = HashMap::new();
        prompts.insert("identity".to_string(), IDENTITY_PROMPT.to_string());
        Self {
            prompts: RwLock::new(prompts),
        }
    }

    pub fn identity(&self) -> String {
        self.get("identity").unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        let guard = self.prompts.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, prompt: impl Into<String>) {
        let mut guard = self.prompts.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.insert(name.into(), prompt.into());
    }
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_preloaded() {
        let registry = PromptRegistry::new();
        assert!(registry.identity().contains("Adjutant"));
    }

    #[test]
    fn prompts_are_replaceable() {
        let registry = PromptRegistry::new();
        registry.set("identity", "test persona");
        assert_eq!(registry.identity(), "test persona");
        assert!(registry.get("missing").is_none());
    }
}

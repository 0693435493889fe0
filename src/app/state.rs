use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::app::config::{GatewayConfig, PromptConfig};
use crate::error::{Error, Result};
use crate::models::fallback::{DispatchPolicy, FallbackConfig};
use crate::models::provider::ProviderKind;
use crate::models::registry::ProviderSettings;
use crate::templates::PromptSet;

/// A prompt with its templates parsed.
#[derive(Debug, Clone)]
pub struct CompiledPrompt {
    pub name: String,
    pub templates: PromptSet,
    pub config: PromptConfig,
    pub fallback: FallbackConfig,
}

/// Read-only state shared by every request.
pub struct AppState {
    config: Arc<GatewayConfig>,
    prompts: HashMap<String, CompiledPrompt>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        info!("Initializing application state");
        config.validate()?;

        let mut prompts = HashMap::new();
        for (name, prompt) in &config.prompts {
            let key = name.to_lowercase();
            if prompts.contains_key(&key) {
                return Err(Error::validation(format!("prompt `{}` is defined twice", key)));
            }
            debug!(prompt = %name, mode = %prompt.mode, "Compiling prompt");
            prompts.insert(
                key,
                CompiledPrompt {
                    name: name.clone(),
                    templates: prompt.compile()?,
                    config: prompt.clone(),
                    fallback: prompt.default_fallback(),
                },
            );
        }

        info!("Loaded {} prompts", prompts.len());
        Ok(Self {
            config: Arc::new(config),
            prompts,
        })
    }

    pub fn get_config(&self) -> Arc<GatewayConfig> {
        Arc::clone(&self.config)
    }

    /// Prompt names are matched case-insensitively.
    pub fn prompt(&self, model: &str) -> Option<&CompiledPrompt> {
        self.prompts.get(&model.trim().to_lowercase())
    }

    pub fn prompt_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.prompts.values().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        self.config.dispatch.policy()
    }

    pub fn provider_settings(&self) -> Result<HashMap<ProviderKind, ProviderSettings>> {
        Ok(self.config.provider_settings()?.into_iter().collect())
    }
}

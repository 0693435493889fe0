use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::error::{Error, Result};
use crate::models::errors::ErrorKind;
use crate::models::fallback::{DispatchPolicy, FallbackConfig, ProviderConfig};
use crate::models::provider::ProviderKind;
use crate::models::registry::ProviderSettings;
use crate::platform::AppPaths;
use crate::templates::{PromptMode, PromptSet};

pub const ENV_PREFIX: &str = "PROMPTGATE";

const SAMPLE_HEADER: &str = "\
# promptgate configuration
#
# Every value can be overridden from the environment, e.g.
#   PROMPTGATE__DISPATCH__TIMEOUT_SECONDS=30
# API keys are read from OPENAI_API_KEY, OPENROUTER_API_KEY and AZURE_API_KEY
# unless a provider section names another variable in `api_key_env`.

";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Connection settings keyed by provider kind (`openai`, `openrouter`, `azure`).
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
    /// Prompts keyed by the `model` value callers send.
    #[serde(default)]
    pub prompts: BTreeMap<String, PromptConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DispatchConfig {
    #[validate(range(min = 1, max = 3600))]
    pub timeout_seconds: u64,
    #[validate(range(max = 60000))]
    pub retry_base_delay_ms: u64,
    #[validate(range(max = 600000))]
    pub retry_max_delay_ms: u64,
    pub retry_jitter: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 60,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 3000,
            retry_jitter: true,
        }
    }
}

impl DispatchConfig {
    pub fn policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            timeout: Some(Duration::from_secs(self.timeout_seconds)),
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter: self.retry_jitter,
        }
    }
}

fn default_supports_tools() -> bool {
    true
}

/// One routable prompt: its templates, its primary target and how it answers.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PromptConfig {
    #[serde(default)]
    pub mode: PromptMode,
    pub system: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub provider: ProviderKind,
    #[validate(length(min = 1))]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(url)]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1))]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub json_mode: bool,
    /// JSON Schema source, kept as text so it can be quoted into the system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<String>,
    #[serde(default = "default_supports_tools")]
    pub supports_tools: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackConfig>,
}

impl PromptConfig {
    pub fn new(system: impl Into<String>, provider: ProviderKind, model_name: impl Into<String>) -> Self {
        Self {
            mode: PromptMode::Static,
            system: system.into(),
            user: None,
            provider,
            model_name: model_name.into(),
            base_url: None,
            max_tokens: None,
            temperature: None,
            json_mode: false,
            json_schema: None,
            supports_tools: true,
            fallback: None,
        }
    }

    pub fn with_mode(mut self, mode: PromptMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackConfig) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_json_schema(mut self, schema: impl Into<String>) -> Self {
        self.json_mode = true;
        self.json_schema = Some(schema.into());
        self
    }

    /// The prompt's own upstream, used when no chain is configured.
    pub fn target(&self) -> ProviderConfig {
        ProviderConfig {
            provider: self.provider,
            model_name: self.model_name.clone(),
            base_url: self.base_url.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            catch_errors: Default::default(),
        }
    }

    /// Configured chain, or the prompt target alone with fallback off.
    pub fn default_fallback(&self) -> FallbackConfig {
        self.fallback
            .clone()
            .unwrap_or_else(|| FallbackConfig::single(self.target()))
    }

    pub fn compile(&self) -> Result<PromptSet> {
        Ok(PromptSet::new(self.mode, &self.system, self.user.as_deref())?)
    }

    pub fn parsed_schema(&self) -> Result<Option<Value>> {
        self.json_schema
            .as_deref()
            .map(|schema| {
                serde_json::from_str(schema).map_err(|e| Error::validation(format!("json_schema is not valid JSON: {}", e)))
            })
            .transpose()
    }
}

impl GatewayConfig {
    /// Layers the TOML file (explicit path, else the per-user default) under
    /// `PROMPTGATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self> {
        let file = match path {
            Some(path) => {
                info!("Loading configuration from: {:?}", path);
                Some(File::from(path).format(FileFormat::Toml).required(true))
            }
            None => match AppPaths::new() {
                Ok(paths) => {
                    let default_file = paths.config_file();
                    debug!("Looking for configuration at: {:?}", default_file);
                    Some(File::from(default_file).format(FileFormat::Toml).required(false))
                }
                Err(e) => {
                    warn!("No default configuration location: {}", e);
                    None
                }
            },
        };

        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        let settings = builder
            .add_source(env.separator("__").try_parsing(true))
            .build()?;

        let config: GatewayConfig = settings.try_deserialize()?;
        config.validate()?;

        info!(prompts = config.prompts.len(), "Configuration loaded successfully");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: GatewayConfig = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", path);

        let content = format!("{}{}", SAMPLE_HEADER, self.to_toml()?);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, content).await?;

        info!("Configuration saved successfully");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        Validate::validate(&self.dispatch).map_err(|e| Error::validation(format!("dispatch: {}", e)))?;
        if self.dispatch.retry_base_delay_ms > self.dispatch.retry_max_delay_ms {
            return Err(Error::validation(
                "dispatch: retry_base_delay_ms must not exceed retry_max_delay_ms",
            ));
        }

        for (name, settings) in &self.providers {
            name.parse::<ProviderKind>().map_err(Error::validation)?;
            if let Some(base_url) = &settings.base_url {
                url::Url::parse(base_url)
                    .map_err(|e| Error::validation(format!("providers.{}: invalid base_url: {}", name, e)))?;
            }
        }

        for (name, prompt) in &self.prompts {
            if name.trim().is_empty() {
                return Err(Error::validation("prompt names must not be empty"));
            }
            Validate::validate(prompt).map_err(|e| Error::validation(format!("prompt `{}`: {}", name, e)))?;
            prompt
                .compile()
                .map_err(|e| Error::validation(format!("prompt `{}`: {}", name, e)))?;
            prompt
                .parsed_schema()
                .map_err(|e| Error::validation(format!("prompt `{}`: {}", name, e)))?;
            if let Some(fallback) = &prompt.fallback {
                fallback
                    .validate()
                    .map_err(|e| Error::validation(format!("prompt `{}` fallback: {}", name, e)))?;
            }
        }

        Ok(())
    }

    /// Provider settings with their keys parsed. Call after `validate`.
    pub fn provider_settings(&self) -> Result<Vec<(ProviderKind, ProviderSettings)>> {
        self.providers
            .iter()
            .map(|(name, settings)| {
                let kind = name.parse::<ProviderKind>().map_err(Error::validation)?;
                Ok((kind, settings.clone()))
            })
            .collect()
    }

    /// What `init-config` writes.
    pub fn sample() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            ProviderKind::OpenRouter.to_string(),
            ProviderSettings {
                referer: Some("https://example.com".to_string()),
                title: Some("promptgate".to_string()),
                ..ProviderSettings::default()
            },
        );

        let mut prompts = BTreeMap::new();
        prompts.insert(
            "support-bot".to_string(),
            PromptConfig {
                max_tokens: Some(512),
                temperature: Some(0.3),
                ..PromptConfig::new(
                    "You are a support agent for {{ company | default(\"our store\") }}.\
                     {% if formal %} Answer formally.{% else %} Keep it friendly.{% endif %}",
                    ProviderKind::OpenRouter,
                    "mistralai/mistral-7b-instruct",
                )
                .with_mode(PromptMode::DynamicSystem)
                .with_fallback(FallbackConfig::chain(
                    vec![
                        ProviderConfig::new(ProviderKind::OpenRouter, "mistralai/mistral-7b-instruct").catching(&[
                            ErrorKind::RateLimit,
                            ErrorKind::ServerError,
                            ErrorKind::Timeout,
                            ErrorKind::NetworkError,
                        ]),
                        ProviderConfig::new(ProviderKind::OpenAI, "gpt-4o-mini").catching_all(),
                    ],
                    1,
                ))
            },
        );
        prompts.insert(
            "summarize".to_string(),
            PromptConfig::new(
                "Summarize the user's text in at most {{ sentences | default(3) }} sentences.",
                ProviderKind::OpenAI,
                "gpt-4o-mini",
            )
            .with_mode(PromptMode::DynamicSystemOnce),
        );

        Self {
            dispatch: DispatchConfig::default(),
            providers,
            prompts,
        }
    }
}

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::models::azure::AzureProvider;
use crate::models::errors::ProviderError;
use crate::models::fallback::ProviderConfig;
use crate::models::openai::{self, OpenAIProvider};
use crate::models::openrouter::{self, OpenRouterProvider};
use crate::models::provider::{ModelProvider, ProviderKind, ProviderResult};

/// Turns a fallback target into a live provider.
pub trait ProviderResolver: Send + Sync {
    fn resolve(&self, config: &ProviderConfig) -> ProviderResult<Arc<dyn ModelProvider>>;
}

/// Per-kind connection settings from the gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Sent as `HTTP-Referer` (OpenRouter only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    /// Sent as `X-Title` (OpenRouter only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

pub fn default_api_key_env(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAI => "OPENAI_API_KEY",
        ProviderKind::OpenRouter => "OPENROUTER_API_KEY",
        ProviderKind::Azure => "AZURE_API_KEY",
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Builds HTTP providers on demand. Credentials are read from the
/// environment at dispatch time; all providers share one connection pool.
#[derive(Clone)]
pub struct HttpProviderRegistry {
    client: Client,
    settings: HashMap<ProviderKind, ProviderSettings>,
    env: EnvLookup,
}

impl HttpProviderRegistry {
    pub fn new(settings: HashMap<ProviderKind, ProviderSettings>) -> ProviderResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            settings,
            env: Arc::new(|name| std::env::var(name).ok()),
        })
    }

    /// Replaces the environment lookup.
    pub fn with_env(mut self, env: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.env = Arc::new(env);
        self
    }

    fn api_key(&self, kind: ProviderKind, settings: &ProviderSettings) -> ProviderResult<String> {
        let var = settings
            .api_key_env
            .as_deref()
            .unwrap_or_else(|| default_api_key_env(kind));

        (self.env)(var)
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ProviderError::Credentials(format!("Missing {}", var)))
    }
}

impl ProviderResolver for HttpProviderRegistry {
    fn resolve(&self, config: &ProviderConfig) -> ProviderResult<Arc<dyn ModelProvider>> {
        let settings = self.settings.get(&config.provider).cloned().unwrap_or_default();
        let api_key = self.api_key(config.provider, &settings)?;
        let base_url = config.base_url.clone().or_else(|| settings.base_url.clone());

        debug!(
            provider = %config.provider,
            model = %config.model_name,
            base_url = base_url.as_deref().unwrap_or("default"),
            "Resolving provider"
        );

        let provider: Arc<dyn ModelProvider> = match config.provider {
            ProviderKind::OpenAI => Arc::new(OpenAIProvider::with_client(
                self.client.clone(),
                api_key,
                base_url.unwrap_or_else(|| openai::DEFAULT_BASE_URL.to_string()),
            )),
            ProviderKind::OpenRouter => Arc::new(
                OpenRouterProvider::new(
                    self.client.clone(),
                    api_key,
                    base_url.or_else(|| Some(openrouter::DEFAULT_BASE_URL.to_string())),
                )
                .with_attribution(settings.referer, settings.title),
            ),
            ProviderKind::Azure => {
                let base_url = base_url
                    .or_else(|| (self.env)("AZURE_BASE_URL"))
                    .ok_or_else(|| ProviderError::Config("Missing Azure base_url (or AZURE_BASE_URL)".to_string()))?;
                Arc::new(AzureProvider::new(self.client.clone(), api_key, base_url))
            }
        };

        Ok(provider)
    }
}

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client,
};
use std::time::Duration;
use tracing::debug;

use crate::models::errors::ProviderError;
use crate::models::provider::{ChatRequest, ChatResponse, ChatStream, ModelProvider, ProviderResult};
use crate::models::wire;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAIProvider {
    pub fn new(api_key: String) -> ProviderResult<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ProviderError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client, api_key, base_url))
    }

    /// Shares an existing connection pool.
    pub fn with_client(client: Client, api_key: String, base_url: String) -> Self {
        Self {
            client,
            api_key,
            base_url,
        }
    }

    fn create_headers(&self) -> ProviderResult<HeaderMap> {
        bearer_headers(&self.api_key)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// `Authorization: Bearer …` plus a JSON content type.
pub(crate) fn bearer_headers(api_key: &str) -> ProviderResult<HeaderMap> {
    let mut headers = HeaderMap::new();

    let auth_value = HeaderValue::from_str(&format!("Bearer {}", api_key))
        .map_err(|e| ProviderError::Credentials(format!("Invalid API key format: {}", e)))?;
    headers.insert(AUTHORIZATION, auth_value);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    Ok(headers)
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
    async fn send_message(&self, request: ChatRequest) -> ProviderResult<ChatResponse> {
        debug!(
            "Sending request to OpenAI: model={}, messages={}",
            request.model,
            request.messages.len()
        );
        wire::complete(&self.client, &self.endpoint(), self.create_headers()?, &request).await
    }

    async fn stream_message(&self, request: ChatRequest) -> ProviderResult<Box<dyn ChatStream>> {
        debug!(
            "Starting streaming request to OpenAI: model={}, messages={}",
            request.model,
            request.messages.len()
        );
        wire::open_stream(&self.client, &self.endpoint(), self.create_headers()?, &request).await
    }

    fn get_provider_name(&self) -> &str {
        "openai"
    }
}

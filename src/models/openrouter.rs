use async_trait::async_trait;
use reqwest::{header::HeaderValue, Client};
use tracing::debug;

use crate::models::openai::bearer_headers;
use crate::models::provider::{ChatRequest, ChatResponse, ChatStream, ModelProvider, ProviderResult};
use crate::models::wire;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// OpenRouter speaks the OpenAI wire format and accepts two optional
/// attribution headers.
pub struct OpenRouterProvider {
    client: Client,
    api_key: String,
    base_url: String,
    referer: Option<String>,
    title: Option<String>,
}

impl OpenRouterProvider {
    pub fn new(client: Client, api_key: String, base_url: Option<String>) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            referer: None,
            title: None,
        }
    }

    pub fn with_attribution(mut self, referer: Option<String>, title: Option<String>) -> Self {
        self.referer = referer;
        self.title = title;
        self
    }

    fn create_headers(&self) -> ProviderResult<reqwest::header::HeaderMap> {
        let mut headers = bearer_headers(&self.api_key)?;
        if let Some(value) = self.referer.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert("http-referer", value);
        }
        if let Some(value) = self.title.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert("x-title", value);
        }
        Ok(headers)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ModelProvider for OpenRouterProvider {
    async fn send_message(&self, request: ChatRequest) -> ProviderResult<ChatResponse> {
        debug!("Sending request to OpenRouter: model={}", request.model);
        wire::complete(&self.client, &self.endpoint(), self.create_headers()?, &request).await
    }

    async fn stream_message(&self, request: ChatRequest) -> ProviderResult<Box<dyn ChatStream>> {
        debug!("Starting streaming request to OpenRouter: model={}", request.model);
        wire::open_stream(&self.client, &self.endpoint(), self.create_headers()?, &request).await
    }

    fn get_provider_name(&self) -> &str {
        "openrouter"
    }
}

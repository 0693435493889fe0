use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client,
};
use tracing::debug;
use url::Url;

use crate::models::errors::ProviderError;
use crate::models::provider::{ChatRequest, ChatResponse, ChatStream, ModelProvider, ProviderResult};
use crate::models::wire;

/// Azure OpenAI. The model name carries the deployment and API version as
/// `deployment|api-version`.
pub struct AzureProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureDeployment {
    pub deployment: String,
    pub api_version: String,
}

impl AzureDeployment {
    pub fn parse(model_name: &str) -> ProviderResult<Self> {
        let mut parts = model_name.splitn(2, '|');
        let deployment = parts.next().map(str::trim).unwrap_or_default();
        let api_version = parts.next().map(str::trim).unwrap_or_default();

        if deployment.is_empty() {
            return Err(ProviderError::Config(format!(
                "Azure model name `{}` is missing the deployment",
                model_name
            )));
        }
        if api_version.is_empty() {
            return Err(ProviderError::Config(format!(
                "Azure model name `{}` is missing the API version (expected `deployment|api-version`)",
                model_name
            )));
        }

        Ok(Self {
            deployment: deployment.to_string(),
            api_version: api_version.to_string(),
        })
    }
}

impl AzureProvider {
    pub fn new(client: Client, api_key: String, base_url: String) -> Self {
        Self {
            client,
            api_key,
            base_url,
        }
    }

    fn create_headers(&self) -> ProviderResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|e| ProviderError::Credentials(format!("Invalid API key format: {}", e)))?;
        headers.insert("api-key", key);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn endpoint(&self, deployment: &AzureDeployment) -> ProviderResult<String> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ProviderError::Config(format!("Invalid Azure base URL `{}`: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::Config(format!("Azure base URL `{}` cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(["openai", "deployments", deployment.deployment.as_str(), "chat", "completions"]);
        url.query_pairs_mut()
            .clear()
            .append_pair("api-version", &deployment.api_version);
        Ok(url.to_string())
    }

    /// Swaps the `deployment|version` model name for the bare deployment.
    fn prepare(&self, mut request: ChatRequest) -> ProviderResult<(String, ChatRequest)> {
        let deployment = AzureDeployment::parse(&request.model)?;
        let url = self.endpoint(&deployment)?;
        request.model = deployment.deployment;
        Ok((url, request))
    }
}

#[async_trait]
impl ModelProvider for AzureProvider {
    async fn send_message(&self, request: ChatRequest) -> ProviderResult<ChatResponse> {
        let (url, request) = self.prepare(request)?;
        debug!("Sending request to Azure: deployment={}", request.model);
        wire::complete(&self.client, &url, self.create_headers()?, &request).await
    }

    async fn stream_message(&self, request: ChatRequest) -> ProviderResult<Box<dyn ChatStream>> {
        let (url, request) = self.prepare(request)?;
        debug!("Starting streaming request to Azure: deployment={}", request.model);
        wire::open_stream(&self.client, &url, self.create_headers()?, &request).await
    }

    fn get_provider_name(&self) -> &str {
        "azure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::errors::ErrorKind;
    use crate::models::provider::Message;

    #[test]
    fn test_deployment_parsing() {
        let parsed = AzureDeployment::parse("gpt-4o-mini|2024-06-01").unwrap();
        assert_eq!(parsed.deployment, "gpt-4o-mini");
        assert_eq!(parsed.api_version, "2024-06-01");

        let err = AzureDeployment::parse("gpt-4o-mini").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(AzureDeployment::parse("|2024-06-01").is_err());
    }

    #[test]
    fn test_endpoint_and_request() {
        let provider = AzureProvider::new(
            Client::new(),
            "azure-key".to_string(),
            "https://example.openai.azure.com/".to_string(),
        );
        let request = ChatRequest::new(vec![Message::user("hi")], "prod-gpt4|2024-06-01");

        let (url, request) = provider.prepare(request).unwrap();
        assert_eq!(
            url,
            "https://example.openai.azure.com/openai/deployments/prod-gpt4/chat/completions?api-version=2024-06-01"
        );
        assert_eq!(request.model, "prod-gpt4");

        let headers = provider.create_headers().unwrap();
        assert_eq!(headers.get("api-key").unwrap(), "azure-key");
    }

    #[test]
    fn test_endpoint_encodes_deployment_and_version() {
        let provider = AzureProvider::new(
            Client::new(),
            "azure-key".to_string(),
            "https://example.openai.azure.com/tenant".to_string(),
        );
        let request = ChatRequest::new(vec![Message::user("hi")], "team a/gpt?x|2024-06-01&debug=1");

        let (url, _) = provider.prepare(request).unwrap();
        assert_eq!(
            url,
            "https://example.openai.azure.com/tenant/openai/deployments/team%20a%2Fgpt%3Fx/chat/completions?api-version=2024-06-01%26debug%3D1"
        );

        let broken = AzureProvider::new(Client::new(), "k".to_string(), "not a url".to_string());
        let err = broken
            .prepare(ChatRequest::new(vec![Message::user("hi")], "dep|v1"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }
}

//! A provider that replays a pre-programmed sequence of outcomes.
//!
//! Backs the orchestration tests and the `simulate` command, where a JSON
//! script stands in for real upstreams.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::models::errors::ProviderError;
use crate::models::fallback::ProviderConfig;
use crate::models::provider::{
    ChatRequest, ChatResponse, ChatStream, ModelProvider, ProviderKind, ProviderResult, StreamChunk, TokenUsage,
};
use crate::models::registry::ProviderResolver;

const DEFAULT_CHUNK_CHARS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScriptedOutcome {
    Success {
        content: String,
    },
    /// Upstream answered with a non-success HTTP status.
    Error {
        status: u16,
        #[serde(default)]
        message: String,
        #[serde(default)]
        error_type: Option<String>,
    },
    Network {
        message: String,
    },
    /// Never answers; only a timeout or cancellation ends the dispatch.
    Hang,
    /// Streams `after_chunks` chunks of `content`, then fails with a network error.
    Interrupted {
        content: String,
        after_chunks: usize,
        message: String,
    },
}

impl ScriptedOutcome {
    pub fn success(content: impl Into<String>) -> Self {
        ScriptedOutcome::Success { content: content.into() }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        ScriptedOutcome::Error {
            status,
            message: message.into(),
            error_type: None,
        }
    }

    fn to_error(&self) -> Option<ProviderError> {
        match self {
            ScriptedOutcome::Error {
                status,
                message,
                error_type,
            } => Some(ProviderError::Api {
                status: *status,
                error_type: error_type.clone(),
                code: None,
                message: message.clone(),
            }),
            ScriptedOutcome::Network { message } => Some(ProviderError::Network(message.clone())),
            _ => None,
        }
    }
}

pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<ScriptedOutcome>>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
    chunk_chars: usize,
    preamble: bool,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(outcomes.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            chunk_chars: DEFAULT_CHUNK_CHARS,
            preamble: false,
        }
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self
    }

    /// Opens every stream with an empty chunk, like the role-only first event
    /// OpenAI-style upstreams send before any content.
    pub fn with_preamble(mut self) -> Self {
        self.preamble = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests seen so far, in dispatch order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }

    fn next_outcome(&self, request: &ChatRequest) -> ProviderResult<ScriptedOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().push(request.clone());
        self.script
            .lock()
            .pop_front()
            .ok_or_else(|| ProviderError::Other(format!("{}: script exhausted after {} calls", self.name, call - 1)))
    }

    fn response_id(&self) -> String {
        format!("{}-{}", self.name, self.calls())
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn send_message(&self, request: ChatRequest) -> ProviderResult<ChatResponse> {
        let outcome = self.next_outcome(&request)?;
        if let Some(error) = outcome.to_error() {
            return Err(error);
        }

        match outcome {
            ScriptedOutcome::Success { content } => {
                let usage = usage_for(&request, &content);
                let mut response = ChatResponse::new(self.response_id(), request.model, content);
                response.usage = Some(usage);
                Ok(response)
            }
            ScriptedOutcome::Interrupted { message, .. } => Err(ProviderError::Network(message)),
            _ => {
                std::future::pending::<()>().await;
                Err(ProviderError::Other("unreachable".to_string()))
            }
        }
    }

    async fn stream_message(&self, request: ChatRequest) -> ProviderResult<Box<dyn ChatStream>> {
        let outcome = self.next_outcome(&request)?;
        if let Some(error) = outcome.to_error() {
            return Err(error);
        }

        let id = self.response_id();
        let (content, fail_after) = match outcome {
            ScriptedOutcome::Success { content } => (content, None),
            ScriptedOutcome::Interrupted {
                content,
                after_chunks,
                message,
            } => (content, Some((after_chunks, message))),
            _ => {
                std::future::pending::<()>().await;
                return Err(ProviderError::Other("unreachable".to_string()));
            }
        };

        let usage = usage_for(&request, &content);
        let mut chunks: VecDeque<StreamChunk> = split_chars(&content, self.chunk_chars)
            .into_iter()
            .map(|piece| StreamChunk::text(id.clone(), piece))
            .collect();

        if self.preamble {
            let mut opener = StreamChunk::text(id.clone(), "");
            opener.model = Some(request.model.clone());
            chunks.push_front(opener);
        }

        let failure = match fail_after {
            Some((after, message)) => {
                chunks.truncate(after + usize::from(self.preamble));
                Some(ProviderError::Network(message))
            }
            None => {
                let mut last = StreamChunk::text(id.clone(), "");
                last.finish_reason = Some("stop".to_string());
                last.usage = Some(usage);
                chunks.push_back(last);
                None
            }
        };

        Ok(Box::new(ScriptedStream { chunks, failure }))
    }

    fn get_provider_name(&self) -> &str {
        &self.name
    }
}

struct ScriptedStream {
    chunks: VecDeque<StreamChunk>,
    failure: Option<ProviderError>,
}

#[async_trait]
impl ChatStream for ScriptedStream {
    async fn next_chunk(&mut self) -> ProviderResult<Option<StreamChunk>> {
        if let Some(chunk) = self.chunks.pop_front() {
            return Ok(Some(chunk));
        }
        match self.failure.take() {
            Some(error) => Err(error),
            None => Ok(None),
        }
    }
}

fn split_chars(content: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

fn usage_for(request: &ChatRequest, content: &str) -> TokenUsage {
    let prompt_words: usize = request
        .messages
        .iter()
        .map(|m| m.text().split_whitespace().count())
        .sum();
    TokenUsage::new(prompt_words as u32, content.split_whitespace().count() as u32)
}

/// Hands out one scripted provider per provider kind.
#[derive(Default, Clone)]
pub struct ScriptedResolver {
    providers: HashMap<ProviderKind, Arc<ScriptedProvider>>,
}

impl ScriptedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ProviderKind, outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        self.insert(kind, ScriptedProvider::new(kind.as_str(), outcomes));
        self
    }

    pub fn insert(&mut self, kind: ProviderKind, provider: ScriptedProvider) {
        self.providers.insert(kind, Arc::new(provider));
    }

    /// Builds a resolver from a `{"openai": [outcomes...], ...}` script.
    pub fn from_script(script: HashMap<ProviderKind, Vec<ScriptedOutcome>>) -> Self {
        script
            .into_iter()
            .fold(Self::new(), |resolver, (kind, outcomes)| resolver.with(kind, outcomes))
    }

    pub fn provider(&self, kind: ProviderKind) -> Option<Arc<ScriptedProvider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn calls(&self, kind: ProviderKind) -> usize {
        self.providers.get(&kind).map(|p| p.calls()).unwrap_or(0)
    }
}

impl ProviderResolver for ScriptedResolver {
    fn resolve(&self, config: &ProviderConfig) -> ProviderResult<Arc<dyn ModelProvider>> {
        self.providers
            .get(&config.provider)
            .map(|p| Arc::clone(p) as Arc<dyn ModelProvider>)
            .ok_or_else(|| ProviderError::Credentials(format!("no scripted provider for {}", config.provider)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::provider::Message;

    fn request() -> ChatRequest {
        ChatRequest::new(vec![Message::user("say hello")], "scripted-model")
    }

    #[tokio::test]
    async fn test_replays_outcomes_in_order() {
        let provider = ScriptedProvider::new(
            "openai",
            vec![ScriptedOutcome::status(429, "slow down"), ScriptedOutcome::success("hi")],
        );

        let err = provider.send_message(request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 429, .. }));

        let response = provider.send_message(request()).await.unwrap();
        assert_eq!(response.content, "hi");
        assert_eq!(response.model, "scripted-model");

        let err = provider.send_message(request()).await.unwrap_err();
        assert!(err.to_string().contains("script exhausted"));
        assert_eq!(provider.calls(), 3);
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_stream_chunks_reassemble() {
        let provider = ScriptedProvider::new("openai", vec![ScriptedOutcome::success("Hello, wörld!")])
            .with_chunk_chars(3);
        let mut stream = provider.stream_message(request()).await.unwrap();

        let mut text = String::new();
        let mut finish = None;
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            text.push_str(&chunk.delta);
            if chunk.finish_reason.is_some() {
                finish = chunk.finish_reason;
            }
        }
        assert_eq!(text, "Hello, wörld!");
        assert_eq!(finish.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_interrupted_stream_fails_after_prefix() {
        let provider = ScriptedProvider::new(
            "openrouter",
            vec![ScriptedOutcome::Interrupted {
                content: "abcdefgh".to_string(),
                after_chunks: 1,
                message: "connection reset".to_string(),
            }],
        );
        let mut stream = provider.stream_message(request()).await.unwrap();
        assert_eq!(stream.next_chunk().await.unwrap().unwrap().delta, "abcd");
        assert!(matches!(stream.next_chunk().await, Err(ProviderError::Network(_))));
    }

    #[tokio::test]
    async fn test_preamble_precedes_content() {
        let provider = ScriptedProvider::new(
            "openai",
            vec![ScriptedOutcome::Interrupted {
                content: "abcdefgh".to_string(),
                after_chunks: 0,
                message: "connection reset".to_string(),
            }],
        )
        .with_preamble();
        let mut stream = provider.stream_message(request()).await.unwrap();

        let opener = stream.next_chunk().await.unwrap().unwrap();
        assert!(!opener.carries_payload());
        assert_eq!(opener.model.as_deref(), Some("scripted-model"));
        assert!(matches!(stream.next_chunk().await, Err(ProviderError::Network(_))));
    }

    #[test]
    fn test_script_deserializes() {
        let script: HashMap<ProviderKind, Vec<ScriptedOutcome>> = serde_json::from_str(
            r#"{
                "openrouter": [{"outcome": "error", "status": 429, "message": "rate limited"}],
                "openai": [{"outcome": "success", "content": "ok"}]
            }"#,
        )
        .unwrap();
        let resolver = ScriptedResolver::from_script(script);
        assert_eq!(resolver.provider(ProviderKind::OpenRouter).unwrap().remaining(), 1);
        assert!(resolver.provider(ProviderKind::Azure).is_none());
    }

    #[test]
    fn test_resolver_reports_missing_provider() {
        let resolver = ScriptedResolver::new();
        let err = resolver
            .resolve(&ProviderConfig::new(ProviderKind::Azure, "gpt"))
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::Credentials(_)));
    }
}

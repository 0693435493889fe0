use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::models::errors::{classify, ProviderError};
use crate::models::fallback::{FallbackConfig, FallbackOrchestrator, OrchestrationError, Orchestrated};
use crate::models::provider::{
    ChatRequest, ChatResponse, ChatStream, ModelProvider, ProviderResult, StreamChunk, TokenUsage,
};

/// Folds relayed chunks back into the response a non-streamed call would give.
#[derive(Debug, Clone)]
pub struct StreamAccumulator {
    id: String,
    model: String,
    content: String,
    tool_calls: BTreeMap<u64, Map<String, Value>>,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
    chunks: usize,
}

impl StreamAccumulator {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            content: String::new(),
            tool_calls: BTreeMap::new(),
            finish_reason: None,
            usage: None,
            chunks: 0,
        }
    }

    pub fn push(&mut self, chunk: &StreamChunk) {
        self.chunks += 1;
        self.content.push_str(&chunk.delta);
        match &chunk.tool_calls {
            Some(Value::Array(items)) => items.iter().for_each(|item| self.merge_tool_call(item)),
            Some(other) => self.merge_tool_call(other),
            None => {}
        }
        if let Some(model) = &chunk.model {
            self.model = model.clone();
        }
        if chunk.finish_reason.is_some() {
            self.finish_reason = chunk.finish_reason.clone();
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
    }

    /// Tool-call deltas arrive as fragments keyed by `index`; the `arguments`
    /// string is split across them.
    fn merge_tool_call(&mut self, fragment: &Value) {
        let Some(fields) = fragment.as_object() else { return };
        let index = fields
            .get("index")
            .and_then(Value::as_u64)
            .unwrap_or(self.tool_calls.len() as u64);
        let call = self.tool_calls.entry(index).or_default();

        for (key, value) in fields {
            match key.as_str() {
                "index" => {}
                "function" => {
                    let function = call
                        .entry("function")
                        .or_insert_with(|| Value::Object(Map::new()));
                    merge_function(function, value);
                }
                _ if !value.is_null() => {
                    call.insert(key.clone(), value.clone());
                }
                _ => {}
            }
        }
    }

    /// Last model the upstream reported, else the committed target's.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn finish(self) -> ChatResponse {
        let mut response = ChatResponse::new(self.id, self.model, self.content);
        response.finish_reason = self.finish_reason.or(Some("stop".to_string()));
        response.usage = self.usage;
        if !self.tool_calls.is_empty() {
            response.tool_calls = Some(Value::Array(
                self.tool_calls.into_values().map(Value::Object).collect(),
            ));
        }
        response
    }
}

impl FallbackOrchestrator {
    /// Streams the request through the fallback chain, relaying chunks to `tx`.
    ///
    /// A provider is committed to once it yields a chunk with content, a tool
    /// call or a finish reason. Empty openers read before that are held back,
    /// so failures up to that point go through the usual retry and fallback
    /// rules. After the commit a failed read ends the request with
    /// `StreamInterrupted`. A closed receiver is treated as cancellation.
    pub async fn execute_stream(
        &self,
        request: &ChatRequest,
        config: &FallbackConfig,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<Orchestrated, OrchestrationError> {
        let read_limit = request.timeout.or(self.policy().timeout);

        let opened = self
            .drive(request, config, |provider, request| open_stream(provider, request, read_limit))
            .await?;

        let Orchestrated {
            response: OpenedStream { mut stream, mut held, ended },
            attempts,
            served_by,
        } = opened;
        let target = &config.providers[served_by];
        let mut accumulator = StreamAccumulator::new(request.id.clone(), target.model_name.clone());

        loop {
            let mut chunk = match held.pop_front() {
                Some(chunk) => chunk,
                None if ended => break,
                None => {
                    let read = tokio::select! {
                        biased;
                        _ = self.cancellation().cancelled() => {
                            return Err(OrchestrationError::Cancelled { attempts });
                        }
                        read = read_chunk(stream.as_mut(), read_limit) => read,
                    };
                    match read {
                        Ok(Some(chunk)) => chunk,
                        Ok(None) => break,
                        Err(error) => {
                            let kind = classify(&error);
                            warn!(
                                request_id = %request.id,
                                provider = %target.provider,
                                chunks = accumulator.chunks(),
                                kind = %kind,
                                error = %error,
                                "Stream interrupted after commit"
                            );
                            return Err(OrchestrationError::StreamInterrupted {
                                error,
                                kind,
                                provider: target.label(),
                                attempts,
                            });
                        }
                    }
                }
            };

            accumulator.push(&chunk);
            if chunk.model.is_none() {
                chunk.model = Some(accumulator.model().to_string());
            }
            if tx.send(chunk).await.is_err() {
                debug!(request_id = %request.id, "Stream receiver closed");
                return Err(OrchestrationError::Cancelled { attempts });
            }
        }

        debug!(request_id = %request.id, chunks = accumulator.chunks(), "Stream complete");
        Ok(Orchestrated {
            response: accumulator.finish(),
            attempts,
            served_by,
        })
    }
}

/// A stream that survived dispatch, with the chunks read while deciding to
/// commit to it.
struct OpenedStream {
    stream: Box<dyn ChatStream>,
    held: VecDeque<StreamChunk>,
    ended: bool,
}

/// Opens the stream and reads until the first chunk worth committing to, or
/// the end of the stream.
async fn open_stream(
    provider: Arc<dyn ModelProvider>,
    request: ChatRequest,
    read_limit: Option<Duration>,
) -> ProviderResult<OpenedStream> {
    let mut stream = provider.stream_message(request.with_streaming()).await?;
    let mut held = VecDeque::new();
    loop {
        match read_chunk(stream.as_mut(), read_limit).await? {
            Some(chunk) if chunk.carries_payload() => {
                held.push_back(chunk);
                return Ok(OpenedStream { stream, held, ended: false });
            }
            Some(chunk) => held.push_back(chunk),
            None => return Ok(OpenedStream { stream, held, ended: true }),
        }
    }
}

fn merge_function(target: &mut Value, fragment: &Value) {
    let (Some(target), Some(fragment)) = (target.as_object_mut(), fragment.as_object()) else {
        return;
    };
    for (key, value) in fragment {
        match (key.as_str(), value.as_str()) {
            ("arguments", Some(piece)) => {
                if let Value::String(arguments) = target
                    .entry("arguments")
                    .or_insert_with(|| Value::String(String::new()))
                {
                    arguments.push_str(piece);
                }
            }
            _ if !value.is_null() => {
                target.insert(key.clone(), value.clone());
            }
            _ => {}
        }
    }
}

async fn read_chunk(
    stream: &mut (dyn ChatStream + '_),
    limit: Option<Duration>,
) -> ProviderResult<Option<StreamChunk>> {
    match limit {
        Some(limit) => timeout(limit, stream.next_chunk())
            .await
            .unwrap_or_else(|_| Err(ProviderError::Timeout(format!("no chunk within {}ms", limit.as_millis())))),
        None => stream.next_chunk().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::errors::ErrorKind;
    use crate::models::fallback::{AttemptStatus, DispatchPolicy, ProviderConfig};
    use crate::models::provider::{Message, ProviderKind};
    use crate::models::scripted::{ScriptedOutcome, ScriptedProvider, ScriptedResolver};
    use serde_json::json;

    const CONTENT: &str = "Streaming keeps every byte, including ünïcödé and emoji 🚀.";

    fn request() -> ChatRequest {
        ChatRequest::new(vec![Message::system("sys"), Message::user("hi")], "gateway-model")
    }

    fn orchestrator(resolver: &ScriptedResolver) -> FallbackOrchestrator {
        FallbackOrchestrator::new(Arc::new(resolver.clone()), DispatchPolicy::immediate())
    }

    fn chain() -> FallbackConfig {
        FallbackConfig::chain(
            vec![
                ProviderConfig::new(ProviderKind::OpenRouter, "router-model").catching_all(),
                ProviderConfig::new(ProviderKind::OpenAI, "gpt-4o-mini").catching_all(),
            ],
            0,
        )
    }

    async fn collect(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_stream_matches_non_streamed_content() {
        let resolver = ScriptedResolver::new().with(
            ProviderKind::OpenAI,
            vec![ScriptedOutcome::success(CONTENT), ScriptedOutcome::success(CONTENT)],
        );
        let config = FallbackConfig::single(ProviderConfig::new(ProviderKind::OpenAI, "gpt-4o-mini"));
        let orchestrator = orchestrator(&resolver);

        let direct = orchestrator.execute(&request(), &config).await.unwrap();

        let (tx, rx) = mpsc::channel(256);
        let streamed = orchestrator.execute_stream(&request(), &config, tx).await.unwrap();
        let chunks = collect(rx).await;

        let relayed: String = chunks.iter().map(|c| c.delta.as_str()).collect();
        assert!(chunks.len() > 1);
        assert_eq!(relayed, direct.response.content);
        assert_eq!(streamed.response.content, direct.response.content);
        assert_eq!(streamed.response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(streamed.response.usage, direct.response.usage);
    }

    #[tokio::test]
    async fn test_open_failure_falls_back_before_first_chunk() {
        let resolver = ScriptedResolver::new()
            .with(ProviderKind::OpenRouter, vec![ScriptedOutcome::status(429, "rate limited")])
            .with(ProviderKind::OpenAI, vec![ScriptedOutcome::success("from openai")]);

        let (tx, rx) = mpsc::channel(64);
        let result = orchestrator(&resolver).execute_stream(&request(), &chain(), tx).await.unwrap();
        let relayed: String = collect(rx).await.iter().map(|c| c.delta.clone()).collect();

        assert_eq!(relayed, "from openai");
        assert_eq!(result.served_by, 1);
        assert_eq!(result.attempts.len(), 2);
        assert_eq!(result.attempts.as_slice()[0].error_kind, Some(ErrorKind::RateLimit));
    }

    #[tokio::test]
    async fn test_first_read_failure_is_still_eligible() {
        let resolver = ScriptedResolver::new()
            .with(
                ProviderKind::OpenRouter,
                vec![ScriptedOutcome::Interrupted {
                    content: "lost".to_string(),
                    after_chunks: 0,
                    message: "connection reset".to_string(),
                }],
            )
            .with(ProviderKind::OpenAI, vec![ScriptedOutcome::success("recovered")]);

        let (tx, rx) = mpsc::channel(64);
        let result = orchestrator(&resolver).execute_stream(&request(), &chain(), tx).await.unwrap();

        assert_eq!(result.response.content, "recovered");
        assert_eq!(result.attempts.as_slice()[0].error_kind, Some(ErrorKind::NetworkError));
        assert!(collect(rx).await.iter().all(|c| !c.delta.contains("lost")));
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_terminal() {
        let resolver = ScriptedResolver::new()
            .with(
                ProviderKind::OpenRouter,
                vec![ScriptedOutcome::Interrupted {
                    content: "partial answer here".to_string(),
                    after_chunks: 2,
                    message: "connection reset".to_string(),
                }],
            )
            .with(ProviderKind::OpenAI, vec![ScriptedOutcome::success("never")]);

        let (tx, rx) = mpsc::channel(64);
        let err = orchestrator(&resolver)
            .execute_stream(&request(), &chain(), tx)
            .await
            .unwrap_err();
        let chunks = collect(rx).await;

        assert!(matches!(
            err,
            OrchestrationError::StreamInterrupted { kind: ErrorKind::NetworkError, .. }
        ));
        assert_eq!(err.attempts().len(), 1);
        assert_eq!(err.attempts()[0].status, AttemptStatus::Success);
        assert_eq!(chunks.len(), 2);
        assert_eq!(resolver.calls(ProviderKind::OpenAI), 0);
    }

    #[tokio::test]
    async fn test_closed_receiver_cancels() {
        let resolver = ScriptedResolver::new().with(ProviderKind::OpenAI, vec![ScriptedOutcome::success(CONTENT)]);
        let config = FallbackConfig::single(ProviderConfig::new(ProviderKind::OpenAI, "gpt-4o-mini"));

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = orchestrator(&resolver).execute_stream(&request(), &config, tx).await.unwrap_err();

        assert!(matches!(err, OrchestrationError::Cancelled { .. }));
        assert_eq!(err.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_stream_is_success() {
        let resolver = ScriptedResolver::new().with(ProviderKind::OpenAI, vec![ScriptedOutcome::success("")]);
        let config = FallbackConfig::single(ProviderConfig::new(ProviderKind::OpenAI, "gpt-4o-mini"));

        let (tx, rx) = mpsc::channel(8);
        let result = orchestrator(&resolver).execute_stream(&request(), &config, tx).await.unwrap();

        assert_eq!(result.response.content, "");
        assert_eq!(collect(rx).await.len(), 1);
    }

    fn interrupted(content: &str, after_chunks: usize) -> ScriptedOutcome {
        ScriptedOutcome::Interrupted {
            content: content.to_string(),
            after_chunks,
            message: "connection reset".to_string(),
        }
    }

    #[tokio::test]
    async fn test_failure_after_empty_opener_falls_back() {
        let mut resolver =
            ScriptedResolver::new().with(ProviderKind::OpenAI, vec![ScriptedOutcome::success("from openai")]);
        resolver.insert(
            ProviderKind::OpenRouter,
            ScriptedProvider::new("openrouter", vec![interrupted("lost", 0)]).with_preamble(),
        );

        let (tx, rx) = mpsc::channel(64);
        let result = orchestrator(&resolver).execute_stream(&request(), &chain(), tx).await.unwrap();
        let chunks = collect(rx).await;
        let relayed: String = chunks.iter().map(|c| c.delta.as_str()).collect();

        assert_eq!(relayed, "from openai");
        assert_eq!(result.served_by, 1);
        assert_eq!(result.attempts.as_slice()[0].status, AttemptStatus::Failed);
        assert_eq!(result.attempts.as_slice()[0].error_kind, Some(ErrorKind::NetworkError));
        assert!(chunks.iter().all(|c| c.id.starts_with("openai")));
    }

    #[tokio::test]
    async fn test_failure_after_content_behind_opener_is_terminal() {
        let mut resolver =
            ScriptedResolver::new().with(ProviderKind::OpenAI, vec![ScriptedOutcome::success("never")]);
        resolver.insert(
            ProviderKind::OpenRouter,
            ScriptedProvider::new("openrouter", vec![interrupted("partial answer", 1)]).with_preamble(),
        );

        let (tx, rx) = mpsc::channel(64);
        let err = orchestrator(&resolver)
            .execute_stream(&request(), &chain(), tx)
            .await
            .unwrap_err();
        let chunks = collect(rx).await;

        assert!(matches!(err, OrchestrationError::StreamInterrupted { .. }));
        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].carries_payload());
        assert_eq!(chunks[1].delta, "part");
        assert_eq!(resolver.calls(ProviderKind::OpenAI), 0);
    }

    #[tokio::test]
    async fn test_held_opener_is_relayed_first() {
        let mut resolver = ScriptedResolver::new();
        resolver.insert(
            ProviderKind::OpenAI,
            ScriptedProvider::new("openai", vec![ScriptedOutcome::success("hello there")]).with_preamble(),
        );
        let config = FallbackConfig::single(ProviderConfig::new(ProviderKind::OpenAI, "gpt-4o-mini"));

        let (tx, rx) = mpsc::channel(64);
        let result = orchestrator(&resolver).execute_stream(&request(), &config, tx).await.unwrap();
        let chunks = collect(rx).await;

        assert_eq!(chunks[0].delta, "");
        assert_eq!(chunks[1].delta, "hell");
        assert!(chunks.iter().all(|c| c.model.as_deref() == Some("gpt-4o-mini")));
        assert_eq!(result.response.content, "hello there");
        assert_eq!(result.response.model, "gpt-4o-mini");
    }

    #[test]
    fn test_accumulator_merges_tool_call_fragments() {
        let mut accumulator = StreamAccumulator::new("id", "model");
        let fragments = [
            json!([{"index": 0, "id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": ""}}]),
            json!([{"index": 0, "function": {"arguments": "{\"city\":"}}]),
            json!([{"index": 1, "id": "call_2", "type": "function", "function": {"name": "time", "arguments": "{}"}}]),
            json!([{"index": 0, "function": {"arguments": "\"Oslo\"}"}}]),
        ];
        for fragment in fragments {
            let mut chunk = StreamChunk::text("id", "");
            chunk.tool_calls = Some(fragment);
            accumulator.push(&chunk);
        }
        accumulator.push(&StreamChunk::text("id", "done"));

        let response = accumulator.finish();
        assert_eq!(response.content, "done");
        assert_eq!(
            response.tool_calls.unwrap(),
            json!([
                {"id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": "{\"city\":\"Oslo\"}"}},
                {"id": "call_2", "type": "function", "function": {"name": "time", "arguments": "{}"}}
            ])
        );
    }
}

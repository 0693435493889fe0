//! OpenAI-shaped chat-completion wire format shared by every HTTP client.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, error};

use crate::models::errors::ProviderError;
use crate::models::provider::{ChatRequest, ChatResponse, ChatStream, Message, ProviderResult, StreamChunk, TokenUsage};

#[derive(Debug, Serialize)]
pub(crate) struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<Value>,
}

impl<'a> WireRequest<'a> {
    pub(crate) fn new(request: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.response_format.as_ref(),
            tools: request.tools.as_ref(),
            stream,
            stream_options: stream.then(|| serde_json::json!({"include_usage": true})),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: String,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Value>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<WireUsage> for TokenUsage {
    fn from(u: WireUsage) -> Self {
        TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireStreamResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    #[serde(default)]
    delta: WireStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Value>,
}

pub(crate) fn parse_response(body: &str, requested_model: &str) -> ProviderResult<ChatResponse> {
    let wire: WireResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse completion: {}", e)))?;

    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::InvalidResponse("no choices in response".to_string()))?;

    let mut response = ChatResponse::new(
        wire.id,
        wire.model.unwrap_or_else(|| requested_model.to_string()),
        choice.message.content.unwrap_or_default(),
    );
    response.tool_calls = choice.message.tool_calls;
    response.finish_reason = choice.finish_reason;
    response.usage = wire.usage.map(TokenUsage::from);
    if let Some(created) = wire.created.and_then(|ts| Utc.timestamp_opt(ts, 0).single()) {
        response.created_at = created;
    }
    Ok(response)
}

#[derive(Debug, PartialEq)]
pub(crate) enum SseEvent {
    Chunk(StreamChunk),
    Done,
    Skip,
}

/// Interprets one line of an SSE body.
pub(crate) fn parse_sse_line(line: &str) -> ProviderResult<SseEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(SseEvent::Skip);
    }

    let data = match line.strip_prefix("data:") {
        Some(data) => data.trim_start(),
        None => return Ok(SseEvent::Skip),
    };
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            debug!("Failed to parse stream event: {} (data: {})", e, data);
            return Ok(SseEvent::Skip);
        }
    };

    if value.get("error").is_some() {
        let status = value
            .pointer("/error/code")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(500);
        return Err(ProviderError::from_response(status, data));
    }

    let event: WireStreamResponse = serde_json::from_value(value)
        .map_err(|e| ProviderError::InvalidResponse(format!("unexpected stream event: {}", e)))?;
    let usage = event.usage.map(TokenUsage::from);

    match event.choices.into_iter().next() {
        Some(choice) => Ok(SseEvent::Chunk(StreamChunk {
            id: event.id,
            model: event.model,
            delta: choice.delta.content.unwrap_or_default(),
            tool_calls: choice.delta.tool_calls,
            finish_reason: choice.finish_reason,
            usage,
        })),
        // Usage-only trailer sent when `include_usage` is on.
        None if usage.is_some() => Ok(SseEvent::Chunk(StreamChunk {
            id: event.id,
            model: event.model,
            delta: String::new(),
            tool_calls: None,
            finish_reason: None,
            usage,
        })),
        None => Ok(SseEvent::Skip),
    }
}

async fn post(client: &Client, url: &str, headers: HeaderMap, body: &WireRequest<'_>) -> ProviderResult<reqwest::Response> {
    let start_time = Instant::now();
    let response = client.post(url).headers(headers).json(body).send().await?;
    debug!(url, status = response.status().as_u16(), elapsed_ms = start_time.elapsed().as_millis() as u64, "Upstream responded");

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        error!(url, status = status.as_u16(), "Upstream API error: {}", error_text);
        return Err(ProviderError::from_response(status.as_u16(), &error_text));
    }
    Ok(response)
}

pub(crate) async fn complete(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    request: &ChatRequest,
) -> ProviderResult<ChatResponse> {
    let response = post(client, url, headers, &WireRequest::new(request, false)).await?;
    let body = response.text().await?;
    parse_response(&body, &request.model)
}

pub(crate) async fn open_stream(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    request: &ChatRequest,
) -> ProviderResult<Box<dyn ChatStream>> {
    let response = post(client, url, headers, &WireRequest::new(request, true)).await?;
    Ok(Box::new(SseStream::new(response)))
}

/// Reads `data:` lines off a streaming completion until `[DONE]`.
pub struct SseStream {
    response: reqwest::Response,
    buffer: Vec<u8>,
    finished: bool,
}

impl SseStream {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            buffer: Vec::new(),
            finished: false,
        }
    }

    async fn read_next_line(&mut self) -> ProviderResult<Option<String>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                return decode_line(&line[..line.len() - 1]).map(Some);
            }
            if self.finished {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.buffer);
                return decode_line(&rest).map(Some);
            }
            match self.response.chunk().await? {
                Some(bytes) => self.buffer.extend_from_slice(&bytes),
                None => self.finished = true,
            }
        }
    }
}

fn decode_line(bytes: &[u8]) -> ProviderResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| ProviderError::InvalidResponse(format!("invalid UTF-8 in stream: {}", e)))
}

#[async_trait]
impl ChatStream for SseStream {
    async fn next_chunk(&mut self) -> ProviderResult<Option<StreamChunk>> {
        while let Some(line) = self.read_next_line().await? {
            match parse_sse_line(&line)? {
                SseEvent::Chunk(chunk) => return Ok(Some(chunk)),
                SseEvent::Done => {
                    self.finished = true;
                    self.buffer.clear();
                    return Ok(None);
                }
                SseEvent::Skip => continue,
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::errors::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_request_body() {
        let request = ChatRequest::new(vec![Message::system("sys"), Message::user("hi")], "gpt-4o")
            .with_max_tokens(32)
            .with_response_format(json!({"type": "json_object"}));

        let body = serde_json::to_value(WireRequest::new(&request, false)).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["max_tokens"], 32);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["stream"], false);
        assert!(body.get("temperature").is_none());
        assert!(body.get("tools").is_none());
        assert!(body.get("stream_options").is_none());

        let body = serde_json::to_value(WireRequest::new(&request, true)).unwrap();
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_parse_completion() {
        let body = json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1739328783,
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{
                "index": 0,
                "finish_reason": "tool_calls",
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "call_1", "type": "function", "function": {"name": "f", "arguments": "{}"}}]
                }
            }],
            "usage": {"prompt_tokens": 23, "completion_tokens": 30, "total_tokens": 53}
        })
        .to_string();

        let response = parse_response(&body, "gpt-4o-mini").unwrap();
        assert_eq!(response.id, "chatcmpl-1");
        assert_eq!(response.model, "gpt-4o-mini-2024-07-18");
        assert_eq!(response.content, "");
        assert_eq!(response.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(response.tool_calls.unwrap()[0]["id"], "call_1");
        assert_eq!(response.usage.unwrap().total_tokens, 53);
        assert_eq!(response.created_at.timestamp(), 1739328783);
    }

    #[test]
    fn test_parse_completion_without_choices() {
        let err = parse_response(r#"{"id": "x", "choices": []}"#, "m").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert!(parse_response("not json", "m").is_err());
    }

    #[test]
    fn test_sse_lines() {
        assert_eq!(parse_sse_line("").unwrap(), SseEvent::Skip);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseEvent::Skip);
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseEvent::Done);

        let line = r#"data: {"id":"c1","model":"gpt","choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        match parse_sse_line(line).unwrap() {
            SseEvent::Chunk(chunk) => {
                assert_eq!(chunk.id, "c1");
                assert_eq!(chunk.delta, "Hel");
                assert!(chunk.finish_reason.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        let trailer = r#"data: {"id":"c1","choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#;
        match parse_sse_line(trailer).unwrap() {
            SseEvent::Chunk(chunk) => assert_eq!(chunk.usage.unwrap().total_tokens, 7),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sse_error_event() {
        let line = r#"data: {"error":{"code":429,"message":"Rate limit exceeded"}}"#;
        let err = parse_sse_line(line).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimit);
    }
}

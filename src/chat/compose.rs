use chrono::Utc;

use crate::chat::types::{
    AssistantMessage, AttemptView, ChatCompletion, ChatCompletionChunk, Choice, ChunkChoice, ChunkDelta, ErrorBody,
    ErrorResponse, GatewayMeta, ProviderErrorView,
};
use crate::error::Error;
use crate::models::fallback::{Attempt, Orchestrated};
use crate::models::provider::StreamChunk;

pub fn attempt_views(attempts: &[Attempt]) -> Vec<AttemptView> {
    attempts
        .iter()
        .map(|a| AttemptView {
            provider: a.provider.to_string(),
            model: a.model.clone(),
            status: a.status,
            error: a.error_kind.map(|k| k.error_code().to_string()),
            message: a.error.clone(),
        })
        .collect()
}

/// Builds the `gateway` object. `served_by` is the winning provider index,
/// `None` when no provider succeeded.
pub fn gateway_meta(attempts: &[Attempt], served_by: Option<usize>) -> GatewayMeta {
    let fallback_used = served_by.map(|i| i > 0).unwrap_or(false);
    let fallback_provider = if fallback_used {
        attempts.iter().rev().find(|a| a.succeeded()).map(|a| a.provider.to_string())
    } else {
        None
    };

    GatewayMeta {
        fallback_used,
        primary_provider: attempts.first().map(|a| a.provider.to_string()),
        fallback_provider,
        primary_error: attempts
            .iter()
            .find(|a| !a.succeeded())
            .and_then(|a| a.error_kind)
            .map(|k| k.as_str().to_string()),
        attempts: attempt_views(attempts),
    }
}

pub fn compose_completion(orchestrated: Orchestrated) -> ChatCompletion {
    let gateway = gateway_meta(orchestrated.attempts.as_slice(), Some(orchestrated.served_by));
    let response = orchestrated.response;

    ChatCompletion {
        id: response.id,
        object: "chat.completion".to_string(),
        created: response.created_at.timestamp(),
        model: response.model,
        choices: vec![Choice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: Some(response.content),
                tool_calls: response.tool_calls,
            },
            finish_reason: response.finish_reason,
        }],
        usage: response.usage,
        gateway,
    }
}

/// Outward error object and the HTTP status that goes with it.
pub fn compose_error(error: &Error) -> (u16, ErrorResponse) {
    let body = match error {
        Error::Orchestration(e) => ErrorBody {
            error_type: e.error_type().to_string(),
            message: e.to_string(),
            provider_errors: e
                .provider_errors()
                .into_iter()
                .map(|(provider, message)| ProviderErrorView { provider, message })
                .collect(),
            attempts: attempt_views(e.attempts()),
        },
        Error::Provider(e) => ErrorBody {
            error_type: e.kind().error_code().to_string(),
            message: e.to_string(),
            provider_errors: Vec::new(),
            attempts: Vec::new(),
        },
        other => ErrorBody {
            error_type: if other.is_request_error() {
                "invalid_request_error".to_string()
            } else {
                "internal_error".to_string()
            },
            message: other.to_string(),
            provider_errors: Vec::new(),
            attempts: Vec::new(),
        },
    };

    (error.http_status(), ErrorResponse { error: body })
}

/// Frames one relayed chunk. The first chunk also announces the role.
pub fn compose_chunk(chunk: &StreamChunk, id: &str, model: &str, created: i64, first: bool) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: chunk.model.clone().unwrap_or_else(|| model.to_string()),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: first.then(|| "assistant".to_string()),
                content: Some(chunk.delta.clone()),
                tool_calls: chunk.tool_calls.clone(),
            },
            finish_reason: chunk.finish_reason.clone(),
        }],
        usage: None,
        gateway: None,
    }
}

/// Trailing chunk carrying usage and the gateway metadata.
pub fn compose_final_chunk(orchestrated: &Orchestrated, id: &str, created: i64) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: orchestrated.response.model.clone(),
        choices: Vec::new(),
        usage: orchestrated.response.usage,
        gateway: Some(gateway_meta(orchestrated.attempts.as_slice(), Some(orchestrated.served_by))),
    }
}

pub fn now() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::errors::{ErrorKind, ProviderError};
    use crate::models::fallback::{AttemptLog, AttemptStatus, OrchestrationError};
    use crate::models::provider::{ChatResponse, ProviderKind};
    use crate::templates::TemplateError;
    use serde_json::json;

    fn attempt(provider: ProviderKind, index: usize, kind: Option<ErrorKind>) -> Attempt {
        Attempt {
            provider,
            model: format!("{}-model", provider),
            provider_index: index,
            retry_index: 0,
            status: if kind.is_some() { AttemptStatus::Failed } else { AttemptStatus::Success },
            error_kind: kind,
            error: kind.map(|k| format!("{} happened", k)),
        }
    }

    #[test]
    fn test_completion_with_fallback() {
        let attempts = AttemptLog::new()
            .record(attempt(ProviderKind::OpenRouter, 0, Some(ErrorKind::RateLimit)))
            .record(attempt(ProviderKind::OpenAI, 1, None));
        let orchestrated = Orchestrated {
            response: ChatResponse::new("chatcmpl-1", "gpt-4o-mini", "Hello from OpenAI"),
            attempts,
            served_by: 1,
        };

        let completion = compose_completion(orchestrated);
        let value = serde_json::to_value(&completion).unwrap();

        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["choices"][0]["message"]["role"], "assistant");
        assert_eq!(value["choices"][0]["message"]["content"], "Hello from OpenAI");
        assert_eq!(value["gateway"]["fallback_used"], true);
        assert_eq!(value["gateway"]["primary_provider"], "openrouter");
        assert_eq!(value["gateway"]["fallback_provider"], "openai");
        assert_eq!(value["gateway"]["primary_error"], "rate_limit");
        assert_eq!(
            value["gateway"]["attempts"][0],
            json!({
                "provider": "openrouter",
                "model": "openrouter-model",
                "status": "failed",
                "error": "rate_limit_exceeded",
                "message": "rate_limit happened"
            })
        );
        assert_eq!(value["gateway"]["attempts"][1]["status"], "success");
        assert!(value["gateway"]["attempts"][1]["error"].is_null());
    }

    #[test]
    fn test_completion_without_fallback() {
        let orchestrated = Orchestrated {
            response: ChatResponse::new("id", "m", "x"),
            attempts: AttemptLog::new().record(attempt(ProviderKind::OpenAI, 0, None)),
            served_by: 0,
        };
        let completion = compose_completion(orchestrated);
        assert!(!completion.gateway.fallback_used);
        assert!(completion.gateway.fallback_provider.is_none());
        assert!(completion.gateway.primary_error.is_none());
        assert_eq!(completion.content(), Some("x"));
    }

    #[test]
    fn test_exhausted_error_object() {
        let attempts = AttemptLog::new()
            .record(attempt(ProviderKind::OpenRouter, 0, Some(ErrorKind::RateLimit)))
            .record(attempt(ProviderKind::OpenAI, 1, Some(ErrorKind::AuthError)));
        let error = Error::from(OrchestrationError::Exhausted {
            attempted: "openrouter(openrouter-model), openai(openai-model)".to_string(),
            last_error: "auth_error happened".to_string(),
            last_kind: ErrorKind::AuthError,
            provider_errors: attempts.provider_errors(),
            attempts,
        });

        let (status, body) = compose_error(&error);
        assert_eq!(status, 401);
        assert_eq!(body.error.error_type, "fallback_exhausted");
        assert!(body.error.message.contains("openrouter(openrouter-model), openai(openai-model)"));
        assert_eq!(body.error.provider_errors.len(), 2);
        assert_eq!(body.error.provider_errors[0].provider, "openrouter(openrouter-model)");
        assert_eq!(body.error.attempts.len(), 2);
    }

    #[test]
    fn test_direct_error_uses_wire_code() {
        let error = Error::from(OrchestrationError::Direct {
            error: ProviderError::api(429, "slow down"),
            kind: ErrorKind::RateLimit,
            attempts: AttemptLog::new().record(attempt(ProviderKind::OpenAI, 0, Some(ErrorKind::RateLimit))),
        });
        let (status, body) = compose_error(&error);
        assert_eq!(status, 429);
        assert_eq!(body.error.error_type, "rate_limit_exceeded");
        assert_eq!(body.error.message, "API error 429: slow down");
    }

    #[test]
    fn test_template_error_is_invalid_request() {
        let error = Error::from(TemplateError::UndefinedVariable {
            name: "customer".to_string(),
        });
        let (status, body) = compose_error(&error);
        assert_eq!(status, 400);
        assert_eq!(body.error.error_type, "invalid_request_error");
        assert!(body.error.attempts.is_empty());
    }

    #[test]
    fn test_chunk_framing() {
        let mut chunk = StreamChunk::text("up-1", "Hel");
        let framed = compose_chunk(&chunk, "chatcmpl-9", "gpt-4o", 1700000000, true);
        assert_eq!(framed.object, "chat.completion.chunk");
        assert_eq!(framed.choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(framed.delta_text(), "Hel");

        chunk.finish_reason = Some("stop".to_string());
        let framed = compose_chunk(&chunk, "chatcmpl-9", "gpt-4o", 1700000000, false);
        assert!(framed.choices[0].delta.role.is_none());
        assert_eq!(framed.choices[0].finish_reason.as_deref(), Some("stop"));
    }
}

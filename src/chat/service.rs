use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::{AppState, CompiledPrompt};
use crate::chat::compose::{self, compose_chunk, compose_completion, compose_final_chunk};
use crate::chat::types::{ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, GatewayMeta};
use crate::error::{Error, Result};
use crate::models::fallback::{FallbackConfig, FallbackOrchestrator};
use crate::models::provider::{ChatRequest, Message, MessageRole, StreamChunk};
use crate::models::registry::ProviderResolver;

/// HTTP header a front end reads the per-request fallback directive from.
pub const FALLBACK_HEADER: &str = "x-fallback-config";

const JSON_SCHEMA_INSTRUCTION: &str = "Please respond in adherence to the following JSON Schema: ";

const RELAY_BUFFER: usize = 64;

/// Parses a fallback directive as carried in [`FALLBACK_HEADER`] or a file.
pub fn parse_directive(text: &str) -> Result<FallbackConfig> {
    FallbackConfig::from_json(text).map_err(Error::validation)
}

/// A request ready for orchestration.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub prompt: String,
    pub request: ChatRequest,
    pub fallback: FallbackConfig,
}

/// Request pipeline: prompt lookup, rendering, orchestration and composition.
pub struct GatewayService {
    app_state: Arc<AppState>,
    resolver: Arc<dyn ProviderResolver>,
}

impl GatewayService {
    pub fn new(app_state: Arc<AppState>, resolver: Arc<dyn ProviderResolver>) -> Self {
        Self { app_state, resolver }
    }

    pub fn app_state(&self) -> &Arc<AppState> {
        &self.app_state
    }

    /// Renders the configured prompt and settles the fallback chain. Fails
    /// before any provider is contacted.
    pub fn prepare(&self, req: &ChatCompletionRequest, directive: Option<&FallbackConfig>) -> Result<PreparedRequest> {
        req.validate()?;

        let prompt = self
            .app_state
            .prompt(&req.model)
            .ok_or_else(|| Error::UnknownModel(req.model.clone()))?;
        let config = &prompt.config;

        let mut messages = prompt.templates.render_messages(&req.messages, req.context.as_ref())?;

        let mut request = ChatRequest::new(Vec::new(), config.model_name.clone());
        request.temperature = config.temperature.or(req.temperature);
        request.max_tokens = config.max_tokens.or(req.max_tokens);
        request.tools = if config.supports_tools { req.tools.clone() } else { None };
        request.response_format = req.response_format.clone();

        if config.json_mode {
            let schema = config.parsed_schema()?;
            if let Some(text) = config.json_schema.as_deref() {
                append_schema_instruction(&mut messages, text);
            }
            if request.response_format.is_none() {
                request.response_format = Some(json_response_format(schema));
            }
        }
        request.messages = messages;

        let fallback = effective_fallback(prompt, directive)?;

        debug!(
            request_id = %request.id,
            prompt = %prompt.name,
            mode = %prompt.templates.mode(),
            providers = fallback.providers.len(),
            fallback_enabled = fallback.enabled,
            "Prepared request"
        );

        Ok(PreparedRequest {
            prompt: prompt.name.clone(),
            request,
            fallback,
        })
    }

    fn orchestrator(&self, cancel: CancellationToken) -> FallbackOrchestrator {
        FallbackOrchestrator::new(Arc::clone(&self.resolver), self.app_state.dispatch_policy()).with_cancellation(cancel)
    }

    pub async fn complete(
        &self,
        req: &ChatCompletionRequest,
        directive: Option<&FallbackConfig>,
        cancel: CancellationToken,
    ) -> Result<ChatCompletion> {
        let prepared = self.prepare(req, directive)?;
        info!(request_id = %prepared.request.id, prompt = %prepared.prompt, "Handling completion");

        let orchestrated = self
            .orchestrator(cancel)
            .execute(&prepared.request, &prepared.fallback)
            .await?;

        if orchestrated.fallback_used() {
            info!(
                request_id = %prepared.request.id,
                attempts = orchestrated.attempts.len(),
                "Completion served by fallback provider"
            );
        }
        Ok(compose_completion(orchestrated))
    }

    /// Streams framed chunks to `tx`. The last chunk sent on success carries
    /// usage and gateway metadata, which is also returned.
    pub async fn complete_stream(
        &self,
        req: &ChatCompletionRequest,
        directive: Option<&FallbackConfig>,
        cancel: CancellationToken,
        tx: mpsc::Sender<ChatCompletionChunk>,
    ) -> Result<GatewayMeta> {
        let prepared = self.prepare(req, directive)?;
        info!(request_id = %prepared.request.id, prompt = %prepared.prompt, "Handling streaming completion");

        let id = prepared.request.id.clone();
        let created = compose::now();
        let (raw_tx, mut raw_rx) = mpsc::channel::<StreamChunk>(RELAY_BUFFER);

        let orchestrator = self.orchestrator(cancel);
        let relay = orchestrator.execute_stream(&prepared.request, &prepared.fallback, raw_tx);
        let forward = async {
            let mut first = true;
            while let Some(chunk) = raw_rx.recv().await {
                let framed = compose_chunk(&chunk, &id, &prepared.request.model, created, first);
                first = false;
                if tx.send(framed).await.is_err() {
                    debug!(request_id = %id, "Downstream receiver closed");
                    break;
                }
            }
        };

        let (outcome, ()) = tokio::join!(relay, forward);
        let orchestrated = outcome?;

        let last = compose_final_chunk(&orchestrated, &id, created);
        let meta = last.gateway.clone().unwrap_or_else(|| compose::gateway_meta(&[], None));
        if tx.send(last).await.is_err() {
            warn!(request_id = %id, "Receiver closed before the final chunk");
        }
        Ok(meta)
    }
}

/// Directive chains win when enabled; otherwise the prompt's own chain, or
/// its single target.
fn effective_fallback(prompt: &CompiledPrompt, directive: Option<&FallbackConfig>) -> Result<FallbackConfig> {
    match directive {
        Some(directive) if directive.enabled => {
            directive.validate().map_err(Error::validation)?;
            Ok(directive.clone())
        }
        Some(_) => Ok(FallbackConfig::single(prompt.config.target())),
        None if prompt.fallback.enabled => Ok(prompt.fallback.clone()),
        None => Ok(FallbackConfig::single(prompt.config.target())),
    }
}

fn append_schema_instruction(messages: &mut Vec<Message>, schema: &str) {
    let instruction = format!("{}{}", JSON_SCHEMA_INSTRUCTION, schema);
    match messages.iter_mut().find(|m| m.role == MessageRole::System) {
        Some(system) => {
            let mut content = system.content.take().unwrap_or_default();
            if !content.is_empty() {
                content.push_str("\n\n");
            }
            content.push_str(&instruction);
            system.content = Some(content);
        }
        None => messages.insert(0, Message::system(instruction)),
    }
}

fn json_response_format(schema: Option<Value>) -> Value {
    match schema {
        Some(schema) => json!({
            "type": "json_object",
            "json_schema": {
                "name": "schema",
                "strict": true,
                "schema": schema,
            }
        }),
        None => json!({ "type": "json_object" }),
    }
}

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::errors::{classify, CatchErrors, ErrorKind, ErrorMatcher, ProviderError};
use crate::models::provider::{ChatRequest, ChatResponse, ModelProvider, ProviderKind, ProviderResult};
use crate::models::registry::ProviderResolver;

/// One upstream target in a fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: ProviderKind,
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub catch_errors: CatchErrors,
}

impl ProviderConfig {
    pub fn new(provider: ProviderKind, model_name: impl Into<String>) -> Self {
        Self {
            provider,
            model_name: model_name.into(),
            base_url: None,
            max_tokens: None,
            temperature: None,
            catch_errors: CatchErrors::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_catch_errors(mut self, catch_errors: CatchErrors) -> Self {
        self.catch_errors = catch_errors;
        self
    }

    pub fn catching(self, kinds: &[ErrorKind]) -> Self {
        self.with_catch_errors(CatchErrors::kinds(kinds))
    }

    pub fn catching_all(self) -> Self {
        self.with_catch_errors(CatchErrors::all())
    }

    /// `provider(model)`, as used in exhaustion messages and provider errors.
    pub fn label(&self) -> String {
        format!("{}({})", self.provider, self.model_name)
    }

    /// The request as this target should receive it. Target settings win
    /// over whatever the request already carries.
    pub fn apply(&self, request: &ChatRequest) -> ChatRequest {
        let mut request = request.clone();
        request.model = self.model_name.clone();
        if let Some(max_tokens) = self.max_tokens {
            request.max_tokens = Some(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            request.temperature = Some(temperature);
        }
        request
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.model_name.trim().is_empty() {
            return Err(format!("{}: model_name must not be empty", self.provider));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("{}: temperature {} is outside 0..=2", self.label(), t));
            }
        }
        if let Some(base_url) = &self.base_url {
            url::Url::parse(base_url).map_err(|e| format!("{}: invalid base_url `{}`: {}", self.label(), base_url, e))?;
        }
        Ok(())
    }
}

/// Raw fallback directive as a caller sends it. Validated into [`FallbackConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackDirective {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_retries_per_provider: i64,
    #[serde(default)]
    pub providers: Vec<ProviderDirective>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDirective {
    pub provider: String,
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub catch_errors: Vec<String>,
}

/// A validated fallback chain. `providers[0]` is the primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FallbackDirective", into = "FallbackDirective")]
pub struct FallbackConfig {
    pub enabled: bool,
    pub providers: Vec<ProviderConfig>,
    pub max_retries_per_provider: u32,
}

impl FallbackConfig {
    pub fn chain(providers: Vec<ProviderConfig>, max_retries_per_provider: u32) -> Self {
        Self {
            enabled: true,
            providers,
            max_retries_per_provider,
        }
    }

    /// A single target with fallback switched off.
    pub fn single(provider: ProviderConfig) -> Self {
        Self {
            enabled: false,
            providers: vec![provider],
            max_retries_per_provider: 0,
        }
    }

    pub fn primary(&self) -> Option<&ProviderConfig> {
        self.providers.first()
    }

    pub fn from_json(text: &str) -> std::result::Result<Self, String> {
        serde_json::from_str(text).map_err(|e| format!("invalid fallback directive: {}", e))
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.enabled && self.providers.is_empty() {
            return Err("fallback is enabled but no providers are configured".to_string());
        }
        self.providers.iter().try_for_each(ProviderConfig::validate)
    }
}

impl TryFrom<FallbackDirective> for FallbackConfig {
    type Error = String;

    fn try_from(raw: FallbackDirective) -> std::result::Result<Self, Self::Error> {
        if raw.max_retries_per_provider < 0 {
            return Err(format!(
                "max_retries_per_provider must be non-negative, got {}",
                raw.max_retries_per_provider
            ));
        }
        let max_retries_per_provider = u32::try_from(raw.max_retries_per_provider)
            .map_err(|_| format!("max_retries_per_provider {} is too large", raw.max_retries_per_provider))?;

        let providers = raw
            .providers
            .into_iter()
            .map(|p| -> std::result::Result<ProviderConfig, String> {
                let catch_errors = p
                    .catch_errors
                    .iter()
                    .map(|s| s.parse::<ErrorMatcher>())
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(ProviderConfig {
                    provider: p.provider.parse()?,
                    model_name: p.model_name,
                    base_url: p.base_url,
                    max_tokens: p.max_tokens,
                    temperature: p.temperature,
                    catch_errors: CatchErrors::new(catch_errors),
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let config = FallbackConfig {
            enabled: raw.enabled,
            providers,
            max_retries_per_provider,
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<FallbackConfig> for FallbackDirective {
    fn from(config: FallbackConfig) -> Self {
        FallbackDirective {
            enabled: config.enabled,
            max_retries_per_provider: i64::from(config.max_retries_per_provider),
            providers: config
                .providers
                .into_iter()
                .map(|p| ProviderDirective {
                    provider: p.provider.to_string(),
                    model_name: p.model_name,
                    base_url: p.base_url,
                    max_tokens: p.max_tokens,
                    temperature: p.temperature,
                    catch_errors: p.catch_errors.matchers().iter().map(|m| m.to_string()).collect(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Success,
    Failed,
}

/// One dispatch, as it happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub provider: ProviderKind,
    pub model: String,
    pub provider_index: usize,
    pub retry_index: u32,
    pub status: AttemptStatus,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

impl Attempt {
    fn success(target: &ProviderConfig, provider_index: usize, retry_index: u32) -> Self {
        Self {
            provider: target.provider,
            model: target.model_name.clone(),
            provider_index,
            retry_index,
            status: AttemptStatus::Success,
            error_kind: None,
            error: None,
        }
    }

    fn failure(
        target: &ProviderConfig,
        provider_index: usize,
        retry_index: u32,
        kind: ErrorKind,
        error: &ProviderError,
    ) -> Self {
        Self {
            provider: target.provider,
            model: target.model_name.clone(),
            provider_index,
            retry_index,
            status: AttemptStatus::Failed,
            error_kind: Some(kind),
            error: Some(error.to_string()),
        }
    }

    pub fn label(&self) -> String {
        format!("{}({})", self.provider, self.model)
    }

    pub fn succeeded(&self) -> bool {
        self.status == AttemptStatus::Success
    }
}

/// Append-only record of every dispatch made for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AttemptLog(Vec<Attempt>);

impl AttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn record(mut self, attempt: Attempt) -> Self {
        self.0.push(attempt);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Attempt> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Attempt] {
        &self.0
    }

    pub fn first_failure(&self) -> Option<&Attempt> {
        self.0.iter().find(|a| !a.succeeded())
    }

    pub fn last(&self) -> Option<&Attempt> {
        self.0.last()
    }

    /// `(provider(model), message)` for every failed attempt, in order.
    pub fn provider_errors(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .filter_map(|a| a.error.as_ref().map(|e| (a.label(), e.clone())))
            .collect()
    }

    /// Distinct `provider(model)` pairs in first-dispatch order.
    pub fn attempted_targets(&self) -> Vec<String> {
        let mut labels: Vec<String> = Vec::new();
        for attempt in &self.0 {
            let label = attempt.label();
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
        labels
    }
}

impl<'a> IntoIterator for &'a AttemptLog {
    type Item = &'a Attempt;
    type IntoIter = std::slice::Iter<'a, Attempt>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Fallback disabled; the single dispatch failed.
    #[error("{error}")]
    Direct {
        error: ProviderError,
        kind: ErrorKind,
        attempts: AttemptLog,
    },

    #[error("{provider} failed with {kind}, which is not eligible for fallback: {error}")]
    Uncaught {
        error: ProviderError,
        kind: ErrorKind,
        provider: String,
        attempts: AttemptLog,
    },

    #[error("all providers failed: {attempted}; last error: {last_error}")]
    Exhausted {
        attempted: String,
        last_error: String,
        last_kind: ErrorKind,
        provider_errors: Vec<(String, String)>,
        attempts: AttemptLog,
    },

    #[error("stream from {provider} interrupted: {error}")]
    StreamInterrupted {
        error: ProviderError,
        kind: ErrorKind,
        provider: String,
        attempts: AttemptLog,
    },

    #[error("request cancelled")]
    Cancelled { attempts: AttemptLog },

    #[error("no providers configured")]
    NoProviders,
}

impl OrchestrationError {
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            OrchestrationError::Direct { attempts, .. }
            | OrchestrationError::Uncaught { attempts, .. }
            | OrchestrationError::Exhausted { attempts, .. }
            | OrchestrationError::StreamInterrupted { attempts, .. }
            | OrchestrationError::Cancelled { attempts } => attempts.as_slice(),
            OrchestrationError::NoProviders => &[],
        }
    }

    /// Canonical kind of the error that ended the run, if a provider produced one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            OrchestrationError::Direct { kind, .. }
            | OrchestrationError::Uncaught { kind, .. }
            | OrchestrationError::StreamInterrupted { kind, .. } => Some(*kind),
            OrchestrationError::Exhausted { last_kind, .. } => Some(*last_kind),
            OrchestrationError::Cancelled { .. } | OrchestrationError::NoProviders => None,
        }
    }

    /// Value of `error.type` in the outward error object.
    pub fn error_type(&self) -> &'static str {
        match self {
            OrchestrationError::Exhausted { .. } => "fallback_exhausted",
            OrchestrationError::Cancelled { .. } => "request_cancelled",
            OrchestrationError::NoProviders => "invalid_request_error",
            other => other.kind().unwrap_or(ErrorKind::Unknown).error_code(),
        }
    }

    pub fn provider_errors(&self) -> Vec<(String, String)> {
        match self {
            OrchestrationError::Exhausted { provider_errors, .. } => provider_errors.clone(),
            OrchestrationError::Direct { attempts, .. }
            | OrchestrationError::Uncaught { attempts, .. }
            | OrchestrationError::StreamInterrupted { attempts, .. }
            | OrchestrationError::Cancelled { attempts } => attempts.provider_errors(),
            OrchestrationError::NoProviders => Vec::new(),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            OrchestrationError::Cancelled { .. } => 499,
            OrchestrationError::NoProviders => 500,
            other => other.kind().unwrap_or(ErrorKind::Unknown).http_status(),
        }
    }
}

/// A successful run: the winning response and how it was reached.
#[derive(Debug, Clone)]
pub struct Orchestrated<T = ChatResponse> {
    pub response: T,
    pub attempts: AttemptLog,
    pub served_by: usize,
}

impl<T> Orchestrated<T> {
    pub fn fallback_used(&self) -> bool {
        self.served_by > 0
    }
}

/// Timing knobs for one orchestration run.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub timeout: Option<Duration>,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub jitter: bool,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(60)),
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(3),
            jitter: true,
        }
    }
}

impl DispatchPolicy {
    /// No waiting between retries.
    pub fn immediate() -> Self {
        Self {
            retry_base_delay: Duration::ZERO,
            retry_max_delay: Duration::ZERO,
            jitter: false,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn backoff(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let base = self.retry_base_delay.as_millis() as u64;
        if base == 0 {
            return Box::new(std::iter::repeat(Duration::ZERO));
        }
        let strategy = ExponentialBackoff::from_millis(base).max_delay(self.retry_max_delay);
        if self.jitter {
            Box::new(strategy.map(jitter))
        } else {
            Box::new(strategy)
        }
    }
}

/// What happens after a failed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Retry { retry: u32 },
    Advance { provider: usize },
    Surface,
    Exhaust,
}

/// Transition out of `Dispatching(provider, retry)` on a classified failure.
pub(crate) fn after_failure(config: &FallbackConfig, provider: usize, retry: u32, kind: ErrorKind) -> Step {
    if !config.enabled {
        return Step::Surface;
    }
    let caught = config
        .providers
        .get(provider)
        .map(|p| p.catch_errors.catches(kind))
        .unwrap_or(false);
    if !caught {
        Step::Surface
    } else if retry < config.max_retries_per_provider {
        Step::Retry { retry: retry + 1 }
    } else if provider + 1 < config.providers.len() {
        Step::Advance { provider: provider + 1 }
    } else {
        Step::Exhaust
    }
}

/// Walks a fallback chain one dispatch at a time.
#[derive(Clone)]
pub struct FallbackOrchestrator {
    resolver: Arc<dyn ProviderResolver>,
    policy: DispatchPolicy,
    cancel: CancellationToken,
}

impl FallbackOrchestrator {
    pub fn new(resolver: Arc<dyn ProviderResolver>, policy: DispatchPolicy) -> Self {
        Self {
            resolver,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn execute(
        &self,
        request: &ChatRequest,
        config: &FallbackConfig,
    ) -> Result<Orchestrated, OrchestrationError> {
        self.drive(request, config, |provider, request| async move {
            provider.send_message(request).await
        })
        .await
    }

    /// Runs the state machine with `dispatch` as the unit of work. A dispatch
    /// counts as a success as soon as `dispatch` resolves to `Ok`.
    pub async fn drive<T, F, Fut>(
        &self,
        request: &ChatRequest,
        config: &FallbackConfig,
        mut dispatch: F,
    ) -> Result<Orchestrated<T>, OrchestrationError>
    where
        F: FnMut(Arc<dyn ModelProvider>, ChatRequest) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        if config.providers.is_empty() {
            return Err(OrchestrationError::NoProviders);
        }

        let mut attempts = AttemptLog::new();
        let mut provider_index = 0;
        let mut retry_index = 0;
        let mut backoff = self.policy.backoff();

        loop {
            let target = &config.providers[provider_index];

            info!(
                request_id = %request.id,
                provider = %target.provider,
                model = %target.model_name,
                attempt = attempts.len() + 1,
                retry = retry_index,
                "Dispatching request"
            );

            let outcome = match self.dispatch_once(target, request, &mut dispatch).await {
                Some(outcome) => outcome,
                None => {
                    warn!(request_id = %request.id, provider = %target.provider, "Dispatch cancelled");
                    return Err(OrchestrationError::Cancelled { attempts });
                }
            };

            let error = match outcome {
                Ok(response) => {
                    attempts = attempts.record(Attempt::success(target, provider_index, retry_index));
                    info!(
                        request_id = %request.id,
                        provider = %target.provider,
                        model = %target.model_name,
                        attempts = attempts.len(),
                        "Dispatch succeeded"
                    );
                    return Ok(Orchestrated {
                        response,
                        attempts,
                        served_by: provider_index,
                    });
                }
                Err(error) => error,
            };

            let kind = classify(&error);
            attempts = attempts.record(Attempt::failure(target, provider_index, retry_index, kind, &error));
            warn!(
                request_id = %request.id,
                provider = %target.provider,
                model = %target.model_name,
                kind = %kind,
                error = %error,
                "Dispatch failed"
            );

            if !config.enabled {
                return Err(OrchestrationError::Direct { error, kind, attempts });
            }

            match after_failure(config, provider_index, retry_index, kind) {
                Step::Surface => {
                    return Err(OrchestrationError::Uncaught {
                        error,
                        kind,
                        provider: target.label(),
                        attempts,
                    });
                }
                Step::Exhaust => {
                    warn!(request_id = %request.id, attempts = attempts.len(), "All providers exhausted");
                    return Err(OrchestrationError::Exhausted {
                        attempted: attempts.attempted_targets().join(", "),
                        last_error: error.to_string(),
                        last_kind: kind,
                        provider_errors: attempts.provider_errors(),
                        attempts,
                    });
                }
                Step::Retry { retry } => {
                    let delay = backoff.next().unwrap_or(self.policy.retry_max_delay);
                    debug!(
                        request_id = %request.id,
                        provider = %target.provider,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying same provider"
                    );
                    if !self.pause(delay).await {
                        return Err(OrchestrationError::Cancelled { attempts });
                    }
                    retry_index = retry;
                }
                Step::Advance { provider } => {
                    info!(
                        request_id = %request.id,
                        from = %target.label(),
                        to = %config.providers[provider].label(),
                        "Falling back to next provider"
                    );
                    provider_index = provider;
                    retry_index = 0;
                    backoff = self.policy.backoff();
                }
            }
        }
    }

    /// One bounded dispatch. `None` means the run was cancelled meanwhile;
    /// the in-flight future is dropped with it.
    async fn dispatch_once<T, F, Fut>(
        &self,
        target: &ProviderConfig,
        request: &ChatRequest,
        dispatch: &mut F,
    ) -> Option<ProviderResult<T>>
    where
        F: FnMut(Arc<dyn ModelProvider>, ChatRequest) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return None;
        }

        let provider = match self.resolver.resolve(target) {
            Ok(provider) => provider,
            Err(error) => return Some(Err(error)),
        };

        let request = target.apply(request);
        let limit = request.timeout.or(self.policy.timeout);
        let call = dispatch(provider, request);

        let bounded = async move {
            match limit {
                Some(limit) => match timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(format!(
                        "no response within {}ms",
                        limit.as_millis()
                    ))),
                },
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = bounded => Some(result),
        }
    }

    /// Sleeps unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

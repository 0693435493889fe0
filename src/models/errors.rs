use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A failed dispatch as reported by a provider client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("API error {status}: {message}")]
    Api {
        status: u16,
        error_type: Option<String>,
        code: Option<String>,
        message: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("missing credentials: {0}")]
    Credentials(String),

    #[error("provider configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        ProviderError::Api {
            status,
            error_type: None,
            code: None,
            message: message.into(),
        }
    }

    /// Builds an error from a non-success HTTP response.
    ///
    /// Understands `{"error": {"type", "code", "message"}}` bodies; anything
    /// else is kept as the message.
    pub fn from_response(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<Value>(body).ok();
        let detail = parsed.as_ref().and_then(|v| v.get("error"));

        let field = |name: &str| -> Option<String> {
            detail.and_then(|d| d.get(name)).and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        };

        let message = field("message")
            .or_else(|| detail.and_then(|d| d.as_str()).map(str::to_string))
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    format!("HTTP {}", status)
                } else {
                    trimmed.chars().take(512).collect()
                }
            });

        ProviderError::Api {
            status,
            error_type: field("type"),
            code: field("code"),
            message,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        classify(self)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            ProviderError::api(status.as_u16(), e.to_string())
        } else if e.is_builder() {
            ProviderError::Config(e.to_string())
        } else if e.is_decode() {
            ProviderError::InvalidResponse(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// The gateway's own classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    AuthError,
    InvalidRequest,
    ServerError,
    NetworkError,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::RateLimit,
        ErrorKind::AuthError,
        ErrorKind::InvalidRequest,
        ErrorKind::ServerError,
        ErrorKind::NetworkError,
        ErrorKind::Timeout,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::ServerError => "server_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Code used in outward error objects and attempt entries.
    pub fn error_code(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit_exceeded",
            ErrorKind::AuthError => "invalid_api_key",
            ErrorKind::InvalidRequest => "invalid_request_error",
            ErrorKind::ServerError => "server_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::RateLimit => 429,
            ErrorKind::AuthError => 401,
            ErrorKind::InvalidRequest => 400,
            ErrorKind::ServerError | ErrorKind::NetworkError => 502,
            ErrorKind::Timeout => 504,
            ErrorKind::Unknown => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    /// Accepts canonical names, wire codes and the short aliases used in
    /// fallback directives (`auth`, `provider_unavailable`).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rate_limit" | "rate_limit_exceeded" => Ok(ErrorKind::RateLimit),
            "auth" | "auth_error" | "invalid_api_key" | "authentication_error" => Ok(ErrorKind::AuthError),
            "invalid_request" | "invalid_request_error" => Ok(ErrorKind::InvalidRequest),
            "server_error" | "provider_unavailable" => Ok(ErrorKind::ServerError),
            "network_error" | "network" => Ok(ErrorKind::NetworkError),
            "timeout" => Ok(ErrorKind::Timeout),
            "unknown" | "unknown_error" => Ok(ErrorKind::Unknown),
            other => Err(format!("unknown error kind `{}`", other)),
        }
    }
}

/// Maps any provider failure onto an [`ErrorKind`]. Never fails.
pub fn classify(error: &ProviderError) -> ErrorKind {
    match error {
        ProviderError::Api {
            status,
            error_type,
            code,
            ..
        } => {
            let by_status = classify_status(*status);
            match by_status {
                ErrorKind::Unknown | ErrorKind::InvalidRequest => {
                    classify_body(error_type.as_deref(), code.as_deref()).unwrap_or(by_status)
                }
                kind => kind,
            }
        }
        ProviderError::Network(_) => ErrorKind::NetworkError,
        ProviderError::Timeout(_) => ErrorKind::Timeout,
        ProviderError::Credentials(_) => ErrorKind::AuthError,
        ProviderError::Config(_) => ErrorKind::InvalidRequest,
        ProviderError::InvalidResponse(_) | ProviderError::Other(_) => ErrorKind::Unknown,
    }
}

fn classify_status(status: u16) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimit,
        401 | 403 => ErrorKind::AuthError,
        408 | 504 => ErrorKind::Timeout,
        400 | 404 | 413 | 422 => ErrorKind::InvalidRequest,
        500..=599 => ErrorKind::ServerError,
        _ => ErrorKind::Unknown,
    }
}

fn classify_body(error_type: Option<&str>, code: Option<&str>) -> Option<ErrorKind> {
    [error_type, code].into_iter().flatten().find_map(|tag| {
        let tag = tag.to_ascii_lowercase();
        if tag.contains("rate_limit") {
            Some(ErrorKind::RateLimit)
        } else if tag == "invalid_api_key" || tag.contains("auth") {
            Some(ErrorKind::AuthError)
        } else if tag.contains("invalid_request") {
            Some(ErrorKind::InvalidRequest)
        } else if tag.contains("timeout") {
            Some(ErrorKind::Timeout)
        } else if tag.contains("server_error") {
            Some(ErrorKind::ServerError)
        } else {
            None
        }
    })
}

/// One entry of a provider's `catch_errors` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ErrorMatcher {
    All,
    Kind(ErrorKind),
}

impl ErrorMatcher {
    pub fn matches(&self, kind: ErrorKind) -> bool {
        match self {
            ErrorMatcher::All => true,
            ErrorMatcher::Kind(k) => *k == kind,
        }
    }
}

impl FromStr for ErrorMatcher {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "all" | "*" => Ok(ErrorMatcher::All),
            other => other.parse().map(ErrorMatcher::Kind),
        }
    }
}

impl TryFrom<String> for ErrorMatcher {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ErrorMatcher> for String {
    fn from(matcher: ErrorMatcher) -> Self {
        matcher.to_string()
    }
}

impl fmt::Display for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMatcher::All => f.write_str("all"),
            ErrorMatcher::Kind(kind) => write!(f, "{}", kind),
        }
    }
}

/// The set of kinds that make a provider hand over to the next one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatchErrors(Vec<ErrorMatcher>);

impl CatchErrors {
    pub fn new(matchers: Vec<ErrorMatcher>) -> Self {
        Self(matchers)
    }

    pub fn all() -> Self {
        Self(vec![ErrorMatcher::All])
    }

    pub fn kinds(kinds: &[ErrorKind]) -> Self {
        Self(kinds.iter().copied().map(ErrorMatcher::Kind).collect())
    }

    pub fn catches(&self, kind: ErrorKind) -> bool {
        self.0.iter().any(|m| m.matches(kind))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matchers(&self) -> &[ErrorMatcher] {
        &self.0
    }
}

use thiserror::Error;

use crate::models::errors::ProviderError;
use crate::models::fallback::OrchestrationError;
use crate::templates::TemplateError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Error::Unknown(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Error::Provider(ProviderError::Other(msg.into()))
    }

    /// Errors raised while shaping the request, before any provider was called.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            Error::Template(_) | Error::Validation(_) | Error::UnknownModel(_) | Error::Json(_)
        )
    }

    /// HTTP status a front end should answer with for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Template(_) | Error::Validation(_) | Error::Json(_) => 400,
            Error::UnknownModel(_) => 404,
            Error::Orchestration(e) => e.http_status(),
            Error::Provider(e) => e.kind().http_status(),
            _ => 500,
        }
    }
}

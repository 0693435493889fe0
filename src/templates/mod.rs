//! Prompt templates: `{{ var }}` interpolation, `{% if %}` blocks and the
//! four ways a configured prompt is fed from an inbound request.

pub mod context;
pub mod modes;
pub mod template;

use thiserror::Error;

pub use context::{TemplateContext, TemplateValue};
pub use modes::{PromptMode, PromptSet};
pub use template::{render, PromptTemplate};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    #[error("malformed template at byte {offset}: {reason}")]
    MalformedTemplate { offset: usize, reason: String },

    #[error("undefined variable `{name}`")]
    UndefinedVariable { name: String },

    #[error("invalid template context: {0}")]
    InvalidContext(String),

    #[error("prompt mode `{0}` requires a user template")]
    MissingUserTemplate(String),
}

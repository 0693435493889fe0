pub mod azure;
pub mod errors;
pub mod fallback;
pub mod openai;
pub mod openrouter;
pub mod provider;
pub mod registry;
pub mod scripted;
pub mod streaming;
pub mod wire;

pub use errors::{classify, CatchErrors, ErrorKind, ErrorMatcher, ProviderError};
pub use fallback::{
    Attempt, AttemptLog, AttemptStatus, DispatchPolicy, FallbackConfig, FallbackDirective, FallbackOrchestrator,
    OrchestrationError, Orchestrated, ProviderConfig,
};
pub use openai::OpenAIProvider;
pub use provider::{
    ChatRequest, ChatResponse, ChatStream, Message, MessageRole, ModelProvider, ProviderKind, ProviderResult,
    StreamChunk, TokenUsage,
};
pub use registry::{HttpProviderRegistry, ProviderResolver, ProviderSettings};
pub use scripted::{ScriptedOutcome, ScriptedProvider, ScriptedResolver};
pub use streaming::StreamAccumulator;

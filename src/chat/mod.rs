pub mod compose;
pub mod service;
pub mod types;

pub use compose::{compose_chunk, compose_completion, compose_error, compose_final_chunk, gateway_meta};
pub use service::{parse_directive, GatewayService, PreparedRequest, FALLBACK_HEADER};
pub use types::{
    AttemptView, ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ErrorResponse, GatewayMeta,
    ProviderErrorView,
};

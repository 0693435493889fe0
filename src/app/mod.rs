pub mod config;
pub mod state;

pub use config::{DispatchConfig, GatewayConfig, PromptConfig};
pub use state::{AppState, CompiledPrompt};

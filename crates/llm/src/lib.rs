pub mod provider;
pub mod providers;

pub use provider::{Generation, LlmError, LlmProvider, Message, Role, TokenUsage};
pub use providers::create_provider;

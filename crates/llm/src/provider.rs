use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A chat message for the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Token counts reported by the backend, when it reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

/// A completed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub response: String,
    /// Model that actually served the request.
    pub model: String,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl Generation {
    pub fn new(response: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            model: model.into(),
            usage: TokenUsage::default(),
        }
    }
}

/// Text generation backend.
///
/// Callers bound a generation with their own timeout; implementations are
/// not expected to be cancellable beyond being dropped.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Run a single-turn generation of `prompt` against `model`.
    async fn generate(&self, prompt: &str, model: &str) -> Result<Generation, LlmError>;

    /// Backend name for logs.
    fn name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("API error: {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    ParseError(String),
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    #[error("{0}")]
    Other(String),
}

pub mod ollama;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use promptbench_core::config::{LlmConfig, OllamaConfig};

use crate::provider::{LlmError, LlmProvider};

/// Create the appropriate LLM provider based on config.
pub fn create_provider(
    llm_config: &LlmConfig,
    ollama_config: &OllamaConfig,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(llm_config.request_timeout_secs))
        .build()?;

    match llm_config.provider.as_str() {
        "openai" => {
            let api_key = llm_config
                .openai_api_key
                .as_ref()
                .ok_or_else(|| LlmError::NotConfigured("OPENAI_API_KEY not set".into()))?;
            let base_url = llm_config
                .openai_base_url
                .as_deref()
                .unwrap_or("https://api.openai.com");
            Ok(Arc::new(openai::OpenAiProvider::new(
                client,
                api_key.clone(),
                base_url.to_string(),
                llm_config.temperature,
                llm_config.max_tokens,
            )))
        }
        "ollama" => Ok(Arc::new(ollama::OllamaProvider::new(
            client,
            ollama_config.url.clone(),
            llm_config.temperature,
        ))),
        other => Err(LlmError::NotConfigured(format!(
            "unknown LLM provider: '{}'",
            other
        ))),
    }
}

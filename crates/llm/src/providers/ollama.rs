use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::provider::{Generation, LlmError, LlmProvider, Message, TokenUsage};

pub struct OllamaProvider {
    client: reqwest::Client,
    url: String,
    temperature: f32,
}

impl OllamaProvider {
    pub fn new(client: reqwest::Client, url: String, temperature: f32) -> Self {
        Self {
            client,
            url,
            temperature,
        }
    }
}

/// `/api/chat` body. Streaming is off: the reply is read as one JSON object.
fn chat_request(prompt: &str, model: &str, temperature: f32) -> serde_json::Value {
    let message = Message::user(prompt);
    json!({
        "model": model,
        "messages": [{ "role": message.role.as_str(), "content": message.content }],
        "stream": false,
        "options": {
            "temperature": temperature,
        },
    })
}

/// Extract the assistant reply and token counts from an `/api/chat` response.
fn parse_chat_response(resp: &serde_json::Value, requested_model: &str) -> Result<Generation, LlmError> {
    let content = resp["message"]["content"]
        .as_str()
        .ok_or_else(|| LlmError::ParseError("missing message.content".into()))?
        .to_string();

    let prompt_tokens = resp["prompt_eval_count"].as_u64().map(|n| n as u32);
    let completion_tokens = resp["eval_count"].as_u64().map(|n| n as u32);
    let total_tokens = match (prompt_tokens, completion_tokens) {
        (Some(p), Some(c)) => Some(p + c),
        _ => None,
    };

    Ok(Generation {
        response: content,
        model: resp["model"].as_str().unwrap_or(requested_model).to_string(),
        usage: TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        },
    })
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn generate(&self, prompt: &str, model: &str) -> Result<Generation, LlmError> {
        let url = format!("{}/api/chat", self.url);
        let body = chat_request(prompt, model, self.temperature);

        debug!(model = %model, "Ollama request to {}", url);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError { status, body });
        }

        let resp: serde_json::Value = response.json().await?;
        parse_chat_response(&resp, model)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::provider::{Generation, LlmError, LlmProvider, Message, TokenUsage};

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(
        client: reqwest::Client,
        api_key: String,
        base_url: String,
        temperature: f32,
        max_tokens: u32,
    ) -> Self {
        Self {
            client,
            api_key,
            base_url,
            temperature,
            max_tokens,
        }
    }
}

fn parse_completion(resp: &serde_json::Value, requested_model: &str) -> Result<Generation, LlmError> {
    let content = resp["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| LlmError::ParseError("missing choices[0].message.content".into()))?
        .to_string();

    let usage = &resp["usage"];
    Ok(Generation {
        response: content,
        model: resp["model"].as_str().unwrap_or(requested_model).to_string(),
        usage: TokenUsage {
            prompt_tokens: usage["prompt_tokens"].as_u64().map(|n| n as u32),
            completion_tokens: usage["completion_tokens"].as_u64().map(|n| n as u32),
            total_tokens: usage["total_tokens"].as_u64().map(|n| n as u32),
        },
    })
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn generate(&self, prompt: &str, model: &str) -> Result<Generation, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let message = Message::user(prompt);

        let body = json!({
            "model": model,
            "messages": [{ "role": message.role.as_str(), "content": message.content }],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        debug!(model = %model, "OpenAI request to {}", url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
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
        parse_completion(&resp, model)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_usage_block() {
        let resp = json!({
            "model": "gpt-4o-2024-08-06",
            "choices": [{ "message": { "role": "assistant", "content": "Echo: x" } }],
            "usage": { "prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12 },
        });
        let generation = parse_completion(&resp, "gpt-4o").unwrap();
        assert_eq!(generation.response, "Echo: x");
        assert_eq!(generation.model, "gpt-4o-2024-08-06");
        assert_eq!(generation.usage.prompt_tokens, Some(9));
        assert_eq!(generation.usage.total_tokens, Some(12));
    }

    #[test]
    fn empty_choices_is_a_parse_error() {
        let resp = json!({ "choices": [] });
        assert!(matches!(
            parse_completion(&resp, "gpt-4o"),
            Err(LlmError::ParseError(_))
        ));
    }
}

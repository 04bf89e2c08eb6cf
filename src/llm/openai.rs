// src/llm/openai.rs
// OpenAI chat-completions dialect. Grounded on
// `examples/original_source/backend/app/services/react_engine.py::_call_openai`:
// POST `{base_url}/chat/completions`, Bearer auth, `tool_choice: "auto"` sent
// only when tools are offered.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{
    messages_to_openai_json, parse_openai_tool_calls, parse_openai_usage, FinishReason, LlmBackend,
    LlmResponse, Message, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
};
use crate::config::LlmProviderConfig;
use crate::error::{HostError, HostResult};

pub struct OpenAiBackend {
    client: Client,
    config: LlmProviderConfig,
}

impl OpenAiBackend {
    pub fn new(client: Client, config: LlmProviderConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(
        &self,
        messages: &[Message],
        system: Option<&str>,
        tools: &[Value],
    ) -> HostResult<LlmResponse> {
        let mut payload = serde_json::json!({
            "model": self.config.default_model,
            "messages": messages_to_openai_json(messages, system),
            "temperature": DEFAULT_TEMPERATURE,
            "max_tokens": DEFAULT_MAX_TOKENS,
        });
        if !tools.is_empty() {
            payload["tools"] = Value::Array(tools.to_vec());
            payload["tool_choice"] = Value::String("auto".to_string());
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HostError::upstream(format!("OpenAI API returned {status}: {body}")));
        }

        let result: Value = response.json().await?;
        let choice = result
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| HostError::upstream("OpenAI response missing choices[0]"))?;
        let message = choice.get("message").cloned().unwrap_or_default();
        let content = message.get("content").and_then(|c| c.as_str()).unwrap_or_default().to_string();
        let tool_calls = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|raw| parse_openai_tool_calls(raw))
            .unwrap_or_default();
        let usage = parse_openai_usage(result.get("usage"));
        let finish_reason = FinishReason::from_openai(choice.get("finish_reason").and_then(|v| v.as_str()));

        Ok(LlmResponse {
            content,
            tool_calls,
            usage,
            model: self.config.default_model.clone(),
            finish_reason,
        })
    }
}

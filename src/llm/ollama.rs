// src/llm/ollama.rs
// Ollama local-server dialect. Grounded on
// `examples/original_source/backend/app/services/react_engine.py::_call_ollama`:
// POST `{base_url}/api/chat`, no auth, `stream: false`, no usage reporting.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{
    parse_openai_tool_calls, FinishReason, LlmBackend, LlmResponse, Message, TokenUsage,
    DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
};
use crate::config::LlmProviderConfig;
use crate::error::{HostError, HostResult};

pub struct OllamaBackend {
    client: Client,
    config: LlmProviderConfig,
}

impl OllamaBackend {
    pub fn new(client: Client, config: LlmProviderConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn complete(
        &self,
        messages: &[Message],
        system: Option<&str>,
        tools: &[Value],
    ) -> HostResult<LlmResponse> {
        let mut chat_messages = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system {
            chat_messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        for message in messages {
            chat_messages.push(serde_json::json!({ "role": message.role, "content": message.content }));
        }

        let mut payload = serde_json::json!({
            "model": self.config.default_model,
            "messages": chat_messages,
            "stream": false,
            "options": {
                "temperature": DEFAULT_TEMPERATURE,
                "num_predict": DEFAULT_MAX_TOKENS,
            },
        });
        if !tools.is_empty() {
            payload["tools"] = Value::Array(tools.to_vec());
        }

        let response = self
            .client
            .post(format!("{}/api/chat", self.config.base_url))
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HostError::upstream(format!("Ollama API returned {status}: {body}")));
        }

        let result: Value = response.json().await?;
        let message = result.get("message").cloned().unwrap_or_default();
        let content = message.get("content").and_then(|c| c.as_str()).unwrap_or_default().to_string();
        let tool_calls = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|raw| parse_openai_tool_calls(raw))
            .unwrap_or_default();
        let finish_reason = FinishReason::from_openai(result.get("done_reason").and_then(|v| v.as_str()));

        Ok(LlmResponse {
            content,
            tool_calls,
            usage: TokenUsage::default(),
            model: self.config.default_model.clone(),
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_ollama() {
        let backend = OllamaBackend::new(
            Client::new(),
            LlmProviderConfig {
                kind: crate::config::LlmProviderKind::Ollama,
                base_url: "http://localhost:11434".to_string(),
                api_key: String::new(),
                default_model: "llama3".to_string(),
            },
        );
        assert_eq!(backend.name(), "ollama");
    }
}

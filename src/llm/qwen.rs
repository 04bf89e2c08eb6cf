// src/llm/qwen.rs
// Qwen dialect, covering both Dashscope-hosted and self-hosted local
// deployments. Grounded on
// `examples/original_source/backend/app/services/react_engine.py::_call_qwen`.
//
// `is_local` is detected from `base_url` rather than a config flag, matching
// the original: anything that isn't a dashscope/aliyun host is assumed to be
// a local vLLM-style deployment, which needs a `Model` header instead of
// (or alongside) bearer auth and doesn't support function calling. The
// original's hardcoded fallback to a bare local IP address is dropped here;
// `base_url` is always supplied by `LlmProviderConfig`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{
    messages_to_openai_json, parse_openai_tool_calls, parse_openai_usage, FinishReason, LlmBackend,
    LlmResponse, Message, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
};
use crate::config::LlmProviderConfig;
use crate::error::{HostError, HostResult};

fn is_local(base_url: &str) -> bool {
    !base_url.contains("dashscope") && !base_url.contains("aliyun")
}

pub struct QwenBackend {
    client: Client,
    config: LlmProviderConfig,
}

impl QwenBackend {
    pub fn new(client: Client, config: LlmProviderConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl LlmBackend for QwenBackend {
    fn name(&self) -> &'static str {
        "qwen"
    }

    async fn complete(
        &self,
        messages: &[Message],
        system: Option<&str>,
        tools: &[Value],
    ) -> HostResult<LlmResponse> {
        let local = is_local(&self.config.base_url);

        let mut payload = serde_json::json!({
            "model": self.config.default_model,
            "messages": messages_to_openai_json(messages, system),
            "temperature": DEFAULT_TEMPERATURE,
            "max_tokens": DEFAULT_MAX_TOKENS,
        });
        if !tools.is_empty() && !local {
            payload["tools"] = Value::Array(tools.to_vec());
            payload["tool_choice"] = Value::String("auto".to_string());
        }

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .json(&payload);
        if local {
            request = request.header("Model", &self.config.default_model);
        }
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HostError::upstream(format!("Qwen API returned {status}: {body}")));
        }

        let result: Value = response.json().await?;
        let choice = result
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| HostError::upstream("Qwen response missing choices[0]"))?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dashscope_host_is_not_local() {
        assert!(!is_local("https://dashscope.aliyuncs.com/compatible-mode/v1"));
        assert!(!is_local("https://aliyun.example.com/v1"));
    }

    #[test]
    fn bare_host_is_local() {
        assert!(is_local("http://10.0.0.5:8000/v1"));
        assert!(is_local("http://localhost:8000/v1"));
    }

    #[test]
    fn name_is_qwen() {
        let backend = QwenBackend::new(
            Client::new(),
            LlmProviderConfig {
                kind: crate::config::LlmProviderKind::QwenLocal,
                base_url: "http://localhost:8000/v1".to_string(),
                api_key: String::new(),
                default_model: "qwen2.5".to_string(),
            },
        );
        assert_eq!(backend.name(), "qwen");
    }
}

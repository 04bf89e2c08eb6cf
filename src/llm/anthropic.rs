// src/llm/anthropic.rs
// Anthropic Messages API dialect. Grounded on
// `examples/original_source/backend/app/services/react_engine.py::_call_anthropic`,
// with one deliberate correction: the original forwards OpenAI-shaped
// `{"role":"tool",...}` messages straight through, which the real Messages
// API rejects. Here tool results become `tool_result` content blocks inside
// a `user` message, and assistant tool calls become `tool_use` content
// blocks, matching what `{base_url}/messages` actually accepts.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{FinishReason, LlmBackend, LlmResponse, Message, TokenUsage, ToolCallInfo, DEFAULT_MAX_TOKENS};
use crate::config::LlmProviderConfig;
use crate::error::{HostError, HostResult};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicBackend {
    client: Client,
    config: LlmProviderConfig,
}

impl AnthropicBackend {
    pub fn new(client: Client, config: LlmProviderConfig) -> Self {
        Self { client, config }
    }
}

/// Splits `messages` into a concatenated system prompt and a list of
/// Anthropic-shaped `{role, content}` messages, converting tool-call and
/// tool-result messages into their `tool_use`/`tool_result` block forms.
fn convert_messages(messages: &[Message], system: Option<&str>) -> (Option<String>, Vec<Value>) {
    let mut system_parts: Vec<String> = system.map(|s| s.to_string()).into_iter().collect();
    let mut out = Vec::with_capacity(messages.len());

    for message in messages {
        if message.role == "system" {
            system_parts.push(message.content.clone());
            continue;
        }

        if let Some(tool_call_id) = &message.tool_call_id {
            out.push(serde_json::json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": tool_call_id,
                    "content": message.content,
                }],
            }));
            continue;
        }

        if let Some(tool_calls) = &message.tool_calls {
            let mut blocks = Vec::new();
            if !message.content.is_empty() {
                blocks.push(serde_json::json!({ "type": "text", "text": message.content }));
            }
            for call in tool_calls {
                blocks.push(serde_json::json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": call.arguments,
                }));
            }
            out.push(serde_json::json!({ "role": "assistant", "content": blocks }));
            continue;
        }

        out.push(serde_json::json!({ "role": message.role, "content": message.content }));
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n"))
    };
    (system, out)
}

fn convert_tools(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let function = tool.get("function").cloned().unwrap_or_else(|| tool.clone());
            let parameters = function
                .get("parameters")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({ "type": "object", "properties": {}, "required": [] }));
            serde_json::json!({
                "name": function.get("name").and_then(|v| v.as_str()).unwrap_or_default(),
                "description": function.get("description").and_then(|v| v.as_str()).unwrap_or_default(),
                "input_schema": parameters,
            })
        })
        .collect()
}

#[async_trait]
impl LlmBackend for AnthropicBackend {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn complete(
        &self,
        messages: &[Message],
        system: Option<&str>,
        tools: &[Value],
    ) -> HostResult<LlmResponse> {
        let (system, chat_messages) = convert_messages(messages, system);

        let mut payload = serde_json::json!({
            "model": self.config.default_model,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "messages": chat_messages,
        });
        if let Some(system) = &system {
            payload["system"] = Value::String(system.clone());
        }
        if !tools.is_empty() {
            payload["tools"] = Value::Array(convert_tools(tools));
        }

        let response = self
            .client
            .post(format!("{}/messages", self.config.base_url))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HostError::upstream(format!("Anthropic API returned {status}: {body}")));
        }

        let result: Value = response.json().await?;
        let blocks = result.get("content").and_then(|c| c.as_array()).cloned().unwrap_or_default();

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in &blocks {
            match block.get("type").and_then(|v| v.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                        content.push_str(text);
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCallInfo {
                        id: block.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        name: block.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        arguments: block.get("input").cloned().unwrap_or_else(|| serde_json::json!({})),
                    });
                }
                _ => {}
            }
        }

        let usage = result
            .get("usage")
            .map(|raw| TokenUsage {
                prompt_tokens: raw.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                completion_tokens: raw.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                total_tokens: raw.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32
                    + raw.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            })
            .unwrap_or_default();
        let finish_reason = FinishReason::from_anthropic(result.get("stop_reason").and_then(|v| v.as_str()));

        Ok(LlmResponse {
            content,
            tool_calls,
            usage,
            model: self.config.default_model.clone(),
            finish_reason,
        })
    }
}

// src/llm/mod.rs
// LLM backend (spec.md §4.H): one normalized `complete()` operation behind
// `LlmBackend`, implemented once per vendor dialect. `Message`/`ToolCallInfo`
// are carried over near-verbatim from `backend/src/llm/provider/mod.rs`'s
// `Message`/`ToolCallInfo`/`LlmProvider` trait shape, generalized from five
// bespoke `chat`/`chat_with_tools`/`stream` methods per provider into one
// `complete()` every dialect implements identically from the ReAct engine's
// point of view.

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod qwen;
pub mod zhipu;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HostResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallInfo {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallInfo>>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: output.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: None,
        }
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCallInfo>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: Some(tool_calls),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The four-valued finish reason spec.md §4.H/§4.G step 7 requires every
/// dialect to normalize its vendor-specific completion-stop field into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FinishReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    Error,
}

impl FinishReason {
    /// Maps the OpenAI-compatible `choices[0].finish_reason` string shared by
    /// the openai/ollama/zhipu/qwen dialects (Ollama's equivalent field is
    /// named `done_reason` but carries the same values).
    pub(crate) fn from_openai(raw: Option<&str>) -> Self {
        match raw {
            Some("length") => FinishReason::MaxTokens,
            Some("content_filter") => FinishReason::Error,
            _ => FinishReason::EndTurn,
        }
    }

    /// Maps Anthropic's `stop_reason` field.
    pub(crate) fn from_anthropic(raw: Option<&str>) -> Self {
        match raw {
            Some("max_tokens") => FinishReason::MaxTokens,
            Some("stop_sequence") => FinishReason::StopSequence,
            _ => FinishReason::EndTurn,
        }
    }
}

/// Normalized completion result, the same shape regardless of which vendor
/// dialect produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallInfo>,
    pub usage: TokenUsage,
    pub model: String,
    pub finish_reason: FinishReason,
}

/// One LLM vendor dialect, normalized to a single request/response shape.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn complete(
        &self,
        messages: &[Message],
        system: Option<&str>,
        tools: &[Value],
    ) -> HostResult<LlmResponse>;
}

/// Default sampling parameters the original `LLMConfig` dataclass carried;
/// the normalized `complete()` signature has no per-call override for these,
/// so every OpenAI-compatible dialect applies them uniformly.
pub(crate) const DEFAULT_TEMPERATURE: f64 = 0.7;
pub(crate) const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Render messages into the OpenAI chat-completion wire shape shared by the
/// openai/ollama/zhipu/qwen dialects: a leading system message (if any)
/// followed by one object per `Message`, tool calls round-tripped through
/// the `function.arguments`-as-JSON-string convention every one of those
/// APIs expects.
pub(crate) fn messages_to_openai_json(messages: &[Message], system: Option<&str>) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system {
        out.push(serde_json::json!({ "role": "system", "content": system }));
    }
    for message in messages {
        if let Some(tool_call_id) = &message.tool_call_id {
            out.push(serde_json::json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": message.content,
            }));
            continue;
        }
        if let Some(tool_calls) = &message.tool_calls {
            out.push(serde_json::json!({
                "role": message.role,
                "content": message.content,
                "tool_calls": tool_calls.iter().map(|call| serde_json::json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": serde_json::to_string(&call.arguments).unwrap_or_else(|_| "{}".to_string()),
                    }
                })).collect::<Vec<_>>(),
            }));
            continue;
        }
        out.push(serde_json::json!({ "role": message.role, "content": message.content }));
    }
    out
}

/// Parse the standard `{prompt_tokens, completion_tokens, total_tokens}`
/// usage object OpenAI-compatible APIs return.
pub(crate) fn parse_openai_usage(raw: Option<&Value>) -> TokenUsage {
    let Some(raw) = raw else { return TokenUsage::default() };
    TokenUsage {
        prompt_tokens: raw.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        completion_tokens: raw.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        total_tokens: raw.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
    }
}

/// Parse an OpenAI-shaped `tool_calls` array (`function.arguments` as a JSON
/// string) into `ToolCallInfo`, decoding failures falling back to an empty
/// object rather than failing the whole response.
pub(crate) fn parse_openai_tool_calls(raw: &[Value]) -> Vec<ToolCallInfo> {
    raw.iter()
        .map(|call| {
            let id = call.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let function = call.get("function").cloned().unwrap_or_default();
            let name = function.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| serde_json::json!({})),
                Some(other) => other.clone(),
                None => serde_json::json!({}),
            };
            ToolCallInfo { id, name, arguments }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_expected_roles() {
        assert_eq!(Message::user("hi").role, "user");
        assert_eq!(Message::assistant("hi").role, "assistant");
        assert_eq!(Message::system("hi").role, "system");
        let tool_msg = Message::tool_result("call_1", "result");
        assert_eq!(tool_msg.role, "tool");
        assert_eq!(tool_msg.tool_call_id, Some("call_1".to_string()));
    }

    #[test]
    fn assistant_with_tool_calls_carries_calls() {
        let msg = Message::assistant_with_tool_calls(
            "",
            vec![ToolCallInfo {
                id: "1".to_string(),
                name: "fs__read".to_string(),
                arguments: serde_json::json!({}),
            }],
        );
        assert_eq!(msg.tool_calls.unwrap().len(), 1);
    }
}

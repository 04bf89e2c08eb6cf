// src/aggregator.rs
// Tool aggregator (spec.md §4.F): fuses the live tool catalogues of every
// connected stdio/SSE session into one flat namespace the ReAct engine sees,
// using `{server_key}__{local_name}` as the public name. Aggregation is a
// snapshot computed on demand from whatever sessions are alive right now —
// no caching layer to invalidate when a server drops or reconnects.
//
// Grounded on `backend/src/operations/engine/tool_router/registry.rs`'s
// table-driven name-to-route mapping, generalized from a single static
// table into a live per-transport union, and on
// `examples/original_source/backend/app/services/mcp_tools_service.py`'s
// `format_for_system_prompt`/`format_for_api_tools`/`parse_tool_call` for
// the dual OpenAI/Anthropic schema and catalogue-rendering shape
// SPEC_FULL.md §11 calls for.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{HostError, HostResult};
use crate::mcp::sse::SseSessionManager;
use crate::mcp::stdio::StdioSessionManager;
use crate::mcp::TransportKind;
use crate::protocol::McpTool;

const NAME_SEPARATOR: &str = "__";

/// A tool fused from one server's advertised `McpTool`, addressable under
/// its globally-unique public name.
#[derive(Debug, Clone)]
pub struct FusedTool {
    pub server_key: String,
    pub local_name: String,
    pub public_name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
    pub transport: TransportKind,
}

impl FusedTool {
    fn new(server_key: &str, transport: TransportKind, tool: McpTool) -> Self {
        let public_name = format!("{server_key}{NAME_SEPARATOR}{}", tool.name);
        Self {
            server_key: server_key.to_string(),
            local_name: tool.name,
            public_name,
            description: tool.description,
            input_schema: tool.input_schema,
            transport,
        }
    }

    /// OpenAI `tools` array entry: `{type: "function", function: {...}}`.
    pub fn to_openai_format(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.public_name,
                "description": self.description.clone().unwrap_or_default(),
                "parameters": self.input_schema.clone().unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            }
        })
    }

    /// Anthropic `tools` array entry: flat name/description/input_schema.
    pub fn to_anthropic_format(&self) -> Value {
        json!({
            "name": self.public_name,
            "description": self.description.clone().unwrap_or_default(),
            "input_schema": self.input_schema.clone().unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        })
    }
}

/// A parsed `public_name` split back into its originating server and the
/// server's own local tool name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedToolCall {
    pub server_key: String,
    pub local_name: String,
}

/// Split `{server_key}__{local_name}` on the *first* occurrence of the
/// separator, since `local_name` itself may legally contain `__`.
pub fn parse_tool_call(public_name: &str) -> HostResult<ParsedToolCall> {
    match public_name.split_once(NAME_SEPARATOR) {
        Some((server_key, local_name)) if !server_key.is_empty() && !local_name.is_empty() => {
            Ok(ParsedToolCall {
                server_key: server_key.to_string(),
                local_name: local_name.to_string(),
            })
        }
        _ => Err(HostError::validation(format!(
            "'{public_name}' is not a valid fused tool name (expected 'server__tool')"
        ))),
    }
}

/// Builds a point-in-time fused view over every live session. Holds no
/// state of its own beyond references to the two session managers so a
/// server connecting or dropping is reflected on the very next call.
pub struct ToolAggregator {
    stdio: Arc<StdioSessionManager>,
    sse: Arc<SseSessionManager>,
}

impl ToolAggregator {
    pub fn new(stdio: Arc<StdioSessionManager>, sse: Arc<SseSessionManager>) -> Self {
        Self { stdio, sse }
    }

    /// All tools across every live session, stdio sessions listed before
    /// SSE sessions when the same server_key exists under both (it should
    /// not in practice, but stdio takes transport priority if it does).
    pub fn all_tools(&self) -> Vec<FusedTool> {
        let mut tools = Vec::new();
        for session in self.stdio.live_sessions() {
            for tool in session.catalogue().tools {
                tools.push(FusedTool::new(&session.server_key, TransportKind::Stdio, tool));
            }
        }
        for session in self.sse.live_sessions() {
            if self.stdio.get(&session.server_key).is_some() {
                continue;
            }
            for tool in session.catalogue().tools {
                tools.push(FusedTool::new(&session.server_key, TransportKind::Sse, tool));
            }
        }
        tools
    }

    pub fn find(&self, public_name: &str) -> HostResult<FusedTool> {
        let parsed = parse_tool_call(public_name)?;
        self.all_tools()
            .into_iter()
            .find(|t| t.server_key == parsed.server_key && t.local_name == parsed.local_name)
            .ok_or_else(|| HostError::not_found(format!("tool '{public_name}'")))
    }

    pub fn to_openai_tools(&self) -> Vec<Value> {
        self.all_tools().iter().map(FusedTool::to_openai_format).collect()
    }

    pub fn to_anthropic_tools(&self) -> Vec<Value> {
        self.all_tools().iter().map(FusedTool::to_anthropic_format).collect()
    }

    /// Markdown tool catalogue injected into the ReAct system prompt
    /// (SPEC_FULL.md §11 supplemented feature), rendered the way
    /// `mcp_tools_service.py::format_for_system_prompt` renders it: name,
    /// description, a parameter table with a `*` required marker, and a
    /// hint that high-risk calls pause for human approval.
    pub fn render_catalogue(&self) -> String {
        render_tool_catalogue(&self.all_tools())
    }
}

/// Renders a fused-tool slice into the markdown catalogue injected into the
/// ReAct system prompt, factored out of `ToolAggregator::render_catalogue`
/// so its parameter-table/risk-hint rendering is unit-testable without a
/// live session.
fn render_tool_catalogue(tools: &[FusedTool]) -> String {
    if tools.is_empty() {
        return "No tools are currently available.".to_string();
    }
    let mut out = String::from("Available tools:\n");
    for tool in tools {
        let description = tool.description.as_deref().unwrap_or("(no description)");
        out.push_str(&format!("- `{}`: {}\n", tool.public_name, description));

        let required = tool
            .input_schema
            .as_ref()
            .and_then(|schema| schema.get("required"))
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>())
            .unwrap_or_default();
        let properties = tool
            .input_schema
            .as_ref()
            .and_then(|schema| schema.get("properties"))
            .and_then(|p| p.as_object());

        if let Some(properties) = properties {
            if !properties.is_empty() {
                out.push_str("  - parameters:\n");
                for (param_name, param_info) in properties {
                    let req_mark = if required.iter().any(|r| r == param_name) { "*" } else { "" };
                    let param_type = param_info.get("type").and_then(|t| t.as_str()).unwrap_or("any");
                    let param_desc = param_info.get("description").and_then(|d| d.as_str()).unwrap_or("");
                    out.push_str(&format!("    - `{param_name}{req_mark}` ({param_type}): {param_desc}\n"));
                }
            }
        }

        let level = crate::risk::RiskClassifier::classify(&tool.local_name);
        if crate::risk::ConfirmationPolicy::default().confirmation_levels.contains(&level) {
            out.push_str(&format!(
                "  - risk: {} — requires human approval before it runs\n",
                level.as_str()
            ));
        }
    }
    out.push_str("\n(`*` marks a required parameter.)\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_first_separator_only() {
        let parsed = parse_tool_call("git__read__file").unwrap();
        assert_eq!(parsed.server_key, "git");
        assert_eq!(parsed.local_name, "read__file");
    }

    #[test]
    fn parse_rejects_names_without_separator() {
        assert!(parse_tool_call("no_separator_here").is_err());
    }

    #[test]
    fn parse_rejects_empty_halves() {
        assert!(parse_tool_call("__foo").is_err());
        assert!(parse_tool_call("foo__").is_err());
    }

    #[test]
    fn fused_tool_public_name_joins_server_and_local() {
        let tool = FusedTool::new(
            "fs",
            TransportKind::Stdio,
            McpTool {
                name: "read_file".to_string(),
                description: Some("Reads a file".to_string()),
                input_schema: None,
            },
        );
        assert_eq!(tool.public_name, "fs__read_file");
    }

    #[test]
    fn openai_format_defaults_missing_schema_to_empty_object() {
        let tool = FusedTool::new(
            "fs",
            TransportKind::Stdio,
            McpTool {
                name: "read_file".to_string(),
                description: None,
                input_schema: None,
            },
        );
        let rendered = tool.to_openai_format();
        assert_eq!(rendered["type"], "function");
        assert_eq!(rendered["function"]["name"], "fs__read_file");
        assert_eq!(rendered["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn anthropic_format_is_flat() {
        let tool = FusedTool::new(
            "fs",
            TransportKind::Stdio,
            McpTool {
                name: "read_file".to_string(),
                description: Some("desc".to_string()),
                input_schema: None,
            },
        );
        let rendered = tool.to_anthropic_format();
        assert_eq!(rendered["name"], "fs__read_file");
        assert!(rendered.get("function").is_none());
    }

    #[test]
    fn render_catalogue_lists_parameters_and_required_marker() {
        let tool = FusedTool::new(
            "fs",
            TransportKind::Stdio,
            McpTool {
                name: "write_file".to_string(),
                description: Some("Writes a file".to_string()),
                input_schema: Some(json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "target path"},
                        "content": {"type": "string", "description": "file contents"},
                    },
                    "required": ["path"],
                })),
            },
        );
        let rendered = render_tool_catalogue(&[tool]);
        assert!(rendered.contains("- `fs__write_file`: Writes a file"));
        assert!(rendered.contains("  - parameters:"));
        assert!(rendered.contains("`path*` (string): target path"));
        assert!(rendered.contains("`content` (string): file contents"));
        assert!(rendered.contains("(`*` marks a required parameter.)"));
    }

    #[test]
    fn render_catalogue_flags_high_risk_tools_for_confirmation() {
        let tool = FusedTool::new(
            "fs",
            TransportKind::Stdio,
            McpTool {
                name: "delete_file".to_string(),
                description: Some("Deletes a file".to_string()),
                input_schema: None,
            },
        );
        let rendered = render_tool_catalogue(&[tool]);
        assert!(rendered.contains("requires human approval before it runs"));
    }

    #[test]
    fn empty_aggregator_renders_placeholder_catalogue() {
        let aggregator = ToolAggregator::new(
            Arc::new(StdioSessionManager::new()),
            Arc::new(SseSessionManager::new(reqwest::Client::new())),
        );
        assert_eq!(aggregator.render_catalogue(), "No tools are currently available.");
    }
}

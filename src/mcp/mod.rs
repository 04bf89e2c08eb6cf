// src/mcp/mod.rs
// MCP transport layer: stdio session manager, SSE session manager, and the
// shared request/response plumbing they both build on.

pub mod sse;
pub mod stdio;
pub mod transport;

use async_trait::async_trait;
use serde::Serialize;

use crate::protocol::{JsonRpcError, McpPrompt, McpResource, McpTool};

/// Which wire transport a server is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Sse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
        }
    }
}

/// Snapshot of a session's liveness and catalogues, used by the (out-of-scope)
/// `GET /servers` HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub server_key: String,
    pub transport: TransportKind,
    pub alive: bool,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
}

/// Implemented by the Host facade; lets a transport session forward
/// server-initiated requests (`sampling/createMessage`, `roots/list`)
/// without the transport layer depending on `host.rs`/`sampling/` directly.
#[async_trait]
pub trait ServerRequestHandler: Send + Sync {
    async fn handle_roots_list(&self, server_key: &str) -> serde_json::Value;

    async fn handle_sampling_create_message(
        &self,
        server_key: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, JsonRpcError>;
}

/// Snapshot of one server's advertised capabilities, returned by both
/// session managers after a successful handshake.
#[derive(Debug, Clone, Default)]
pub struct CapabilityCatalogue {
    pub tools: Vec<McpTool>,
    pub resources: Vec<McpResource>,
    pub prompts: Vec<McpPrompt>,
}

// src/lib.rs
// Re-exports and module wiring for the MCP host library.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod hitl;
pub mod host;
pub mod llm;
pub mod mcp;
pub mod metrics;
pub mod protocol;
pub mod react;
pub mod risk;
pub mod roots;
pub mod sampling;

pub use config::Config;
pub use error::{HostError, HostResult};
pub use host::{Host, HostSession, ToolCallRequest, ToolCallResult};
pub use react::{ReActEngine, ReActEvent};

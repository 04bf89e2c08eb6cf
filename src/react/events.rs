// src/react/events.rs
// Tagged-union event kinds the ReAct engine streams out (spec.md §6.3).
//
// `spec.md` §9 flags "introduce tagged-union types for the in-memory
// representation of the six event kinds... so that the ReAct engine is
// statically exhaustive over cases" as a required re-architecture from the
// source's dynamic-dict event shape. There is no direct teacher analog for
// this enum; the channel/`Stream` plumbing it rides on borrows the idiom
// from `backend/src/api/ws/chat/`'s streaming-event-over-an-async-channel
// pattern, used here only for the transport mechanics, not the event shapes
// themselves (those come straight from spec.md §6.3).

use serde::Serialize;
use serde_json::Value;

/// One emission of the ReAct event stream. `#[serde(tag = "type")]` renders
/// each variant as the wire shape in spec.md §6.3 (`{type: "...", ...}`),
/// and the stream is terminated by a literal `data: [DONE]` line the
/// (out-of-scope) HTTP surface appends after the last `ReActEvent`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReActEvent {
    State {
        state: ReActState,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ToolCall {
        tool: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments: Option<Value>,
        state: ToolCallPhase,
    },
    ToolResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        execution_time_ms: u64,
    },
    ConfirmationRequired {
        request_id: String,
        tool: String,
        arguments: Value,
        risk_level: String,
        message: String,
    },
    ToolRejected {
        request_id: String,
        message: String,
    },
    Final {
        content: String,
        steps: u32,
    },
    Error {
        error: String,
    },
}

/// `state:"reasoning"|...` values a `State` event may carry; mirrors the
/// `ReActContext`'s own state enum (spec.md §3) one-for-one so a `state`
/// event always reflects the context's real current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReActState {
    Idle,
    Reasoning,
    PendingConfirmation,
    ExecutingTool,
    Generating,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallPhase {
    Preparing,
    Executing,
}

impl ReActEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReActEvent::Final { .. } | ReActEvent::Error { .. })
    }

    pub fn suspends(&self) -> bool {
        matches!(self, ReActEvent::ConfirmationRequired { .. })
    }
}

// src/error.rs
// Crate-wide error taxonomy for the MCP host runtime

use thiserror::Error;

/// The eight error kinds named in the host's error handling design.
///
/// Each variant carries enough detail for a caller to act on it without
/// inspecting a source chain. `From` impls at subsystem boundaries convert
/// foreign errors (`reqwest`, `io`, `serde_json`, join errors) into the kind
/// that best describes where they surfaced.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("policy denied: {0}")]
    Policy(String),

    #[error("policy denied: path {path} not within roots {roots:?}")]
    PathDenied { path: String, roots: Vec<String> },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type HostResult<T> = Result<T, HostError>;

impl HostError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// HTTP status the (external) HTTP surface should map this to.
    pub fn status_code(&self) -> u16 {
        match self {
            HostError::Validation(_) => 400,
            HostError::NotFound(_) => 404,
            HostError::Conflict(_) => 409,
            HostError::Policy(_) | HostError::PathDenied { .. } => 403,
            HostError::Transport(_) => 502,
            HostError::Timeout(_) => 504,
            HostError::Upstream(_) => 502,
            HostError::Fatal(_) => 500,
        }
    }

    /// JSON-RPC error code the MCP wire layer should map this to.
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            HostError::Validation(_) => -32602,
            HostError::NotFound(_) => -32601,
            HostError::Conflict(_) => -32600,
            HostError::Policy(_) | HostError::PathDenied { .. } => -32600,
            HostError::Transport(_) => -32603,
            HostError::Timeout(_) => -32603,
            HostError::Upstream(_) => -32603,
            HostError::Fatal(_) => -32603,
        }
    }
}

impl From<std::io::Error> for HostError {
    fn from(e: std::io::Error) -> Self {
        HostError::Transport(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for HostError {
    fn from(e: serde_json::Error) -> Self {
        HostError::Validation(format!("json error: {e}"))
    }
}

impl From<reqwest::Error> for HostError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HostError::Timeout(std::time::Duration::from_secs(0))
        } else {
            HostError::Transport(format!("http error: {e}"))
        }
    }
}

impl From<tokio::task::JoinError> for HostError {
    fn from(e: tokio::task::JoinError) -> Self {
        HostError::Fatal(format!("task join error: {e}"))
    }
}

/// Extension trait for converting foreign error types the way the teacher's
/// `IntoGitError` converts `git2::Error`/`io::Error` at call sites that need
/// a specific kind rather than the blanket `From` mapping.
pub trait IntoHostError<T> {
    fn upstream_err(self, context: impl Into<String>) -> HostResult<T>;
    fn transport_err(self, context: impl Into<String>) -> HostResult<T>;
}

impl<T, E: std::fmt::Display> IntoHostError<T> for Result<T, E> {
    fn upstream_err(self, context: impl Into<String>) -> HostResult<T> {
        self.map_err(|e| HostError::Upstream(format!("{}: {}", context.into(), e)))
    }

    fn transport_err(self, context: impl Into<String>) -> HostResult<T> {
        self.map_err(|e| HostError::Transport(format!("{}: {}", context.into(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_400_and_32602() {
        let e = HostError::validation("bad input");
        assert_eq!(e.status_code(), 400);
        assert_eq!(e.json_rpc_code(), -32602);
    }

    #[test]
    fn path_denied_maps_to_403() {
        let e = HostError::PathDenied {
            path: "/etc/hosts".to_string(),
            roots: vec!["/project".to_string()],
        };
        assert_eq!(e.status_code(), 403);
        assert!(e.to_string().contains("/etc/hosts"));
    }

    #[test]
    fn not_found_maps_to_404() {
        let e = HostError::not_found("session s1");
        assert_eq!(e.status_code(), 404);
    }

    #[test]
    fn into_host_error_wraps_context() {
        let r: Result<(), &str> = Err("boom");
        let wrapped = r.transport_err("spawning child");
        assert!(matches!(wrapped, Err(HostError::Transport(_))));
    }
}

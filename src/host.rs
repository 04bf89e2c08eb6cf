// src/host.rs
// Host facade (spec.md §4.J): the thin aggregator over every other
// subsystem and the single surface other code holds a handle to. Replaces
// the source's global singleton services with one explicitly constructed
// `Host` value per §9's "replace global singletons" redesign flag, modeled
// the way `backend`'s binaries build their service structs in `main.rs`
// rather than reaching for `lazy_static`.
//
// Grounded on `examples/original_source/backend/app/services/
// mcp_host_service.py` for the exact prepare/execute/confirm control flow,
// including `was_confirmed` semantics and the `force=true,
// skip_path_validation=true` combination used only from `confirm_tool_call`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::{parse_tool_call, FusedTool, ToolAggregator};
use crate::config::Config;
use crate::error::{HostError, HostResult};
use crate::hitl::{ConfirmationStatus, HitlGate, PendingToolCall};
use crate::llm::Message;
use crate::mcp::sse::SseSessionManager;
use crate::mcp::stdio::StdioSessionManager;
use crate::mcp::ServerRequestHandler;
use crate::metrics::ToolCallTimer;
use crate::protocol::{JsonRpcError, ToolResult};
use crate::risk::RiskClassifier;
use crate::roots::RootsRegistry;
use crate::sampling::SamplingService;

/// One tool-call request, immutable once dispatched. Mirrors spec.md §3's
/// `ToolCallRequest` data-model entry.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub session_id: String,
    pub server_key: String,
    pub tool_local_name: String,
    pub public_tool_name: String,
    pub arguments: Value,
    pub risk_level: crate::risk::RiskLevel,
    pub requires_confirmation: bool,
    pub created_at: DateTime<Utc>,
}

/// Result of dispatching a `ToolCallRequest`. One-to-one with its request.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub request_id: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub was_confirmed: bool,
    pub was_rejected: bool,
}

/// One conversation the host is holding open. Identity is a UUID; no
/// conversation is persisted across process restarts (spec.md §1
/// non-goal).
pub struct HostSession {
    pub id: String,
    pub conversation: Vec<Message>,
    pub pending_confirmation_ids: Vec<String>,
    pub results: HashMap<String, ToolCallResult>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl HostSession {
    fn new(id: String, system_prompt: Option<String>) -> Self {
        let mut conversation = Vec::new();
        if let Some(prompt) = system_prompt {
            conversation.push(Message::system(prompt));
        }
        let now = Utc::now();
        Self {
            id,
            conversation,
            pending_confirmation_ids: Vec::new(),
            results: HashMap::new(),
            created_at: now,
            last_activity: now,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Owns every other subsystem. The single value the process entry point
/// constructs; every other service is a field inside it.
pub struct Host {
    pub config: Config,
    pub stdio: Arc<StdioSessionManager>,
    pub sse: Arc<SseSessionManager>,
    pub roots: Arc<RootsRegistry>,
    pub hitl: Arc<HitlGate>,
    pub sampling: Arc<SamplingService>,
    llm_backends: HashMap<String, Arc<dyn crate::llm::LlmBackend>>,
    sessions: Mutex<HashMap<String, HostSession>>,
    background_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Host {
    pub fn new(
        config: Config,
        roots: Arc<RootsRegistry>,
        hitl: Arc<HitlGate>,
        sampling: Arc<SamplingService>,
        llm_backends: HashMap<String, Arc<dyn crate::llm::LlmBackend>>,
        http_client: reqwest::Client,
    ) -> Arc<Self> {
        let host = Arc::new(Self {
            config,
            stdio: Arc::new(StdioSessionManager::new()),
            sse: Arc::new(SseSessionManager::new(http_client)),
            roots,
            hitl,
            sampling,
            llm_backends,
            sessions: Mutex::new(HashMap::new()),
            background_tasks: Mutex::new(Vec::new()),
        });
        let sweep = host.hitl.spawn_sweep_task();
        let sampling_sweep = host.sampling.spawn_sweep_task();
        host.background_tasks.lock().push(sweep);
        host.background_tasks.lock().push(sampling_sweep);
        host
    }

    pub fn aggregator(&self) -> ToolAggregator {
        ToolAggregator::new(self.stdio.clone(), self.sse.clone())
    }

    pub fn llm_backend(&self, provider: &str) -> HostResult<Arc<dyn crate::llm::LlmBackend>> {
        self.llm_backends
            .get(provider)
            .cloned()
            .ok_or_else(|| HostError::not_found(format!("llm provider '{provider}'")))
    }

    pub fn create_session(&self, id: Option<String>, system_prompt: Option<String>) -> String {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.sessions
            .lock()
            .entry(id.clone())
            .or_insert_with(|| HostSession::new(id.clone(), system_prompt));
        id
    }

    pub fn with_session<T>(&self, session_id: &str, f: impl FnOnce(&mut HostSession) -> T) -> HostResult<T> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| HostError::not_found(format!("session '{session_id}'")))?;
        session.touch();
        Ok(f(session))
    }

    pub fn get_aggregated_tools(&self) -> Vec<FusedTool> {
        self.aggregator().all_tools()
    }

    /// The single point where risk classification, path extraction and
    /// path validation run (spec.md §4.J).
    pub fn prepare_tool_call(
        &self,
        session_id: &str,
        public_tool_name: &str,
        arguments: Value,
    ) -> HostResult<ToolCallRequest> {
        let parsed = parse_tool_call(public_tool_name)?;
        self.aggregator().find(public_tool_name)?;

        let (all_allowed, _results) = self.roots.validate_tool_call(session_id, &arguments);
        let risk_level = RiskClassifier::classify_with_paths(&parsed.local_name, !all_allowed);
        let requires_confirmation = self.hitl.needs_confirmation(public_tool_name, risk_level);

        Ok(ToolCallRequest {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            server_key: parsed.server_key,
            tool_local_name: parsed.local_name,
            public_tool_name: public_tool_name.to_string(),
            arguments,
            risk_level,
            requires_confirmation,
            created_at: Utc::now(),
        })
    }

    /// Dispatches a prepared request to its owning transport. Re-runs path
    /// validation by default even if `prepare_tool_call` already ran it;
    /// `skip_path_validation` is only valid when `force` is also set, as a
    /// consequence of an explicit human approval in `confirm_tool_call`.
    pub async fn execute_tool_call(
        &self,
        request: &ToolCallRequest,
        force: bool,
        skip_path_validation: bool,
    ) -> ToolCallResult {
        let mut timer = ToolCallTimer::start(request.risk_level.as_str());
        let start = Instant::now();

        if !skip_path_validation || !force {
            let (all_allowed, results) = self.roots.validate_tool_call(&request.session_id, &request.arguments);
            if !all_allowed && !force {
                timer.mark_failed();
                let denied_paths: Vec<String> = results
                    .iter()
                    .filter(|r| r.outcome != crate::roots::ValidationOutcome::Allowed)
                    .map(|r| r.path.clone())
                    .collect();
                warn!(request_id = %request.id, ?denied_paths, "tool call execution denied by roots");
                return ToolCallResult {
                    request_id: request.id.clone(),
                    success: false,
                    result: None,
                    error: Some(format!("path(s) denied by roots: {denied_paths:?}")),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    was_confirmed: false,
                    was_rejected: false,
                };
            }
        }

        let params = serde_json::json!({
            "name": request.tool_local_name,
            "arguments": request.arguments,
        });

        let outcome = if let Some(session) = self.stdio.get(&request.server_key) {
            session.call("tools/call", Some(params)).await
        } else if let Some(session) = self.sse.get(&request.server_key) {
            session.call("tools/call", Some(params)).await
        } else {
            timer.mark_failed();
            return ToolCallResult {
                request_id: request.id.clone(),
                success: false,
                error: Some(format!("server '{}' is not connected", request.server_key)),
                result: None,
                elapsed_ms: start.elapsed().as_millis() as u64,
                was_confirmed: false,
                was_rejected: false,
            };
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(value) => {
                let tool_result: Option<ToolResult> = serde_json::from_value(value.clone()).ok();
                let is_error = tool_result.as_ref().map(|r| r.is_error).unwrap_or(false);
                if is_error {
                    timer.mark_failed();
                }
                ToolCallResult {
                    request_id: request.id.clone(),
                    success: !is_error,
                    result: Some(value),
                    error: None,
                    elapsed_ms,
                    was_confirmed: false,
                    was_rejected: false,
                }
            }
            Err(e) => {
                timer.mark_failed();
                ToolCallResult {
                    request_id: request.id.clone(),
                    success: false,
                    result: None,
                    error: Some(e.to_string()),
                    elapsed_ms,
                    was_confirmed: false,
                    was_rejected: false,
                }
            }
        }
    }

    /// The combined "HITL.approve + execute" (or reject) operation.
    pub async fn confirm_tool_call(
        &self,
        request_id: &str,
        approver: &str,
        approved: bool,
        modified_args: Option<Value>,
        reason: Option<&str>,
    ) -> HostResult<ToolCallResult> {
        if !approved {
            self.hitl.reject(request_id, approver, reason.unwrap_or("rejected by user"))?;
            crate::metrics::record_hitl_decision("rejected");
            return Ok(ToolCallResult {
                request_id: request_id.to_string(),
                success: false,
                result: None,
                error: Some("user rejected the tool call".to_string()),
                elapsed_ms: 0,
                was_confirmed: false,
                was_rejected: true,
            });
        }

        let confirmation = self.hitl.approve(request_id, approver, modified_args)?;
        crate::metrics::record_hitl_decision(match confirmation.status {
            ConfirmationStatus::Modified => "modified",
            _ => "approved",
        });

        let pending: PendingToolCall = confirmation.tool_call;
        let request = ToolCallRequest {
            id: pending.request_id,
            session_id: pending.session_id,
            server_key: pending.server_key,
            tool_local_name: pending.tool_local_name,
            public_tool_name: pending.public_tool_name,
            arguments: pending.arguments,
            risk_level: pending.risk_level,
            requires_confirmation: true,
            created_at: confirmation.created_at,
        };

        let mut result = self.execute_tool_call(&request, true, true).await;
        result.was_confirmed = true;
        Ok(result)
    }

    /// Stops every stdio session, closes every SSE session, and aborts the
    /// HITL/sampling sweep tasks. Safe to call more than once.
    pub async fn cleanup_all(&self) {
        self.stdio.stop_all().await;
        self.sse.stop_all().await;
        for handle in self.background_tasks.lock().drain(..) {
            handle.abort();
        }
        info!("host cleanup_all complete");
    }

    /// Every server's liveness and transport, merging both managers'
    /// status lists for the (out-of-scope) `GET /servers` HTTP surface.
    pub fn server_statuses(&self) -> Vec<crate::mcp::SessionStatus> {
        let mut statuses = self.stdio.statuses();
        statuses.extend(self.sse.statuses());
        statuses
    }
}

/// Routes server-initiated `roots/list` and `sampling/createMessage`
/// requests arriving over either transport back into the Host's own
/// services, so the transport layer never depends on `roots`/`sampling`
/// directly.
#[async_trait]
impl ServerRequestHandler for Host {
    async fn handle_roots_list(&self, server_key: &str) -> Value {
        let roots = self.roots.list(server_key);
        serde_json::json!({
            "roots": roots.iter().map(|r| serde_json::json!({
                "uri": r.uri(),
                "name": r.name,
            })).collect::<Vec<_>>(),
        })
    }

    async fn handle_sampling_create_message(
        &self,
        server_key: &str,
        params: Value,
    ) -> Result<Value, JsonRpcError> {
        self.sampling.handle_create_message(server_key, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hitl::HitlGate;
    use crate::roots::RootsRegistry;
    use crate::sampling::{SamplingRequest, SamplingResponse, SamplingContent, SamplingExecutor, StopReason};
    use async_trait::async_trait;

    struct EchoExecutor;

    #[async_trait]
    impl SamplingExecutor for EchoExecutor {
        async fn complete(&self, request: &SamplingRequest) -> Result<SamplingResponse, String> {
            Ok(SamplingResponse {
                role: "assistant".to_string(),
                content: SamplingContent::Text(format!("echo: {}", request.messages.len())),
                model: "fake".to_string(),
                stop_reason: Some(StopReason::EndTurn),
            })
        }
    }

    fn test_host() -> Arc<Host> {
        let config = Config::for_tests();
        let roots = Arc::new(RootsRegistry::new(config.host.roots_strict_mode_default));
        let hitl = Arc::new(HitlGate::new(&config.hitl));
        let sampling = Arc::new(SamplingService::new(config.sampling.clone(), Arc::new(EchoExecutor)));
        Host::new(config, roots, hitl, sampling, HashMap::new(), reqwest::Client::new())
    }

    #[test]
    fn create_session_returns_stable_id_for_repeat_calls() {
        let host = test_host();
        let id = host.create_session(Some("s1".to_string()), None);
        assert_eq!(id, "s1");
        let id2 = host.create_session(Some("s1".to_string()), None);
        assert_eq!(id2, "s1");
    }

    #[test]
    fn prepare_tool_call_fails_fast_when_tool_unknown() {
        let host = test_host();
        host.create_session(Some("s1".to_string()), None);
        let result = host.prepare_tool_call("s1", "nope__tool", serde_json::json!({}));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn execute_tool_call_fails_fast_when_server_missing() {
        let host = test_host();
        host.create_session(Some("s1".to_string()), None);
        let request = ToolCallRequest {
            id: "r1".to_string(),
            session_id: "s1".to_string(),
            server_key: "ghost".to_string(),
            tool_local_name: "echo".to_string(),
            public_tool_name: "ghost__echo".to_string(),
            arguments: serde_json::json!({}),
            risk_level: crate::risk::RiskLevel::Low,
            requires_confirmation: false,
            created_at: Utc::now(),
        };
        let result = host.execute_tool_call(&request, false, false).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not connected"));
    }

    #[tokio::test]
    async fn confirm_tool_call_with_approved_false_marks_rejected() {
        let host = test_host();
        host.create_session(Some("s1".to_string()), None);
        let pending = PendingToolCall {
            request_id: "r1".to_string(),
            session_id: "s1".to_string(),
            server_key: "fs".to_string(),
            tool_local_name: "write_file".to_string(),
            public_tool_name: "fs__write_file".to_string(),
            arguments: serde_json::json!({"path": "/tmp/x"}),
            risk_level: crate::risk::RiskLevel::High,
        };
        let confirmation = host.hitl.create(pending);
        let result = host
            .confirm_tool_call(&confirmation.id, "user", false, None, Some("no"))
            .await
            .unwrap();
        assert!(result.was_rejected);
        assert!(!result.success);
    }
}

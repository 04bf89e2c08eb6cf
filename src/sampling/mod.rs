// src/sampling/mod.rs
// Sampling service (spec.md §4.G): mediates `sampling/createMessage`
// requests an MCP server sends upstream, through a seven-step pipeline:
// parse -> server permission -> rate limit -> token clamp -> content filter
// -> approval decision -> execute.
//
// Types (`SamplingRequest`/`SamplingMessage`/`SamplingContent`/`ContentPart`/
// `ModelPreferences`/`StopReason`) are carried over from
// `backend/src/mcp/sampling.rs` nearly verbatim; the approval machinery is
// rebuilt around `HitlGate`'s pending/audit pattern instead of the teacher's
// single `SamplingApprovalHandler` trait, since spec.md requires a queryable
// pending-approval queue and an audit log rather than a synchronous
// approve/deny callback. Pipeline ordering and exact JSON-RPC error codes
// come from `examples/original_source/backend/app/services/sampling_service.py`.

pub mod rate_limit;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use self::rate_limit::SamplingRateLimiter;
use crate::config::SamplingSecurityConfig;
use crate::protocol::JsonRpcError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingRequest {
    pub messages: Vec<SamplingMessage>,
    #[serde(default, rename = "modelPreferences")]
    pub model_preferences: Option<ModelPreferences>,
    #[serde(default, rename = "systemPrompt")]
    pub system_prompt: Option<String>,
    #[serde(default, rename = "includeContext")]
    pub include_context: Option<IncludeContext>,
    #[serde(default, rename = "maxTokens")]
    pub max_tokens: Option<u32>,
    #[serde(default, rename = "stopSequences")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingMessage {
    pub role: String,
    pub content: SamplingContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SamplingContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl SamplingContent {
    pub fn as_text(&self) -> String {
        match self {
            SamplingContent::Text(t) => t.clone(),
            SamplingContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.clone()),
                    ContentPart::Image { .. } => Some("[image]".to_string()),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelPreferences {
    #[serde(default)]
    pub hints: Vec<ModelHint>,
    #[serde(default, rename = "costPriority")]
    pub cost_priority: Option<f32>,
    #[serde(default, rename = "speedPriority")]
    pub speed_priority: Option<f32>,
    #[serde(default, rename = "intelligencePriority")]
    pub intelligence_priority: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHint {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IncludeContext {
    #[default]
    None,
    ThisServer,
    AllServers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingResponse {
    pub role: String,
    pub content: SamplingContent,
    pub model: String,
    #[serde(default, rename = "stopReason")]
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    EndTurn,
    StopSequence,
    MaxTokens,
    Error,
}

/// Backend abstraction the sampling service calls after approval; kept
/// separate from `llm::LlmBackend` to avoid a circular module dependency
/// (the LLM module does not know about sampling types).
#[async_trait]
pub trait SamplingExecutor: Send + Sync {
    async fn complete(&self, request: &SamplingRequest) -> Result<SamplingResponse, String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOutcome {
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone)]
pub struct PendingSamplingRequest {
    pub id: String,
    pub server_key: String,
    pub request: SamplingRequest,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SamplingAuditEntry {
    pub id: String,
    pub server_key: String,
    pub outcome: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
}

struct Inner {
    pending: HashMap<String, PendingSamplingRequest>,
    audit: Vec<SamplingAuditEntry>,
}

/// Mediates every `sampling/createMessage` call an MCP server sends.
pub struct SamplingService {
    config: SamplingSecurityConfig,
    limiter: SamplingRateLimiter,
    inner: Mutex<Inner>,
    executor: Arc<dyn SamplingExecutor>,
    audit_cap: usize,
}

impl SamplingService {
    pub fn new(config: SamplingSecurityConfig, executor: Arc<dyn SamplingExecutor>) -> Self {
        let limiter = SamplingRateLimiter::new(
            config.rate_limit_per_minute,
            config.rate_limit_per_server_per_minute,
        );
        Self {
            config,
            limiter,
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                audit: Vec::new(),
            }),
            executor,
            audit_cap: 1000,
        }
    }

    /// Runs the seven-step pipeline and either executes the completion
    /// directly (auto-approved) or returns a `needs_approval` JSON-RPC
    /// error carrying the pending request's id for the caller to poll.
    pub async fn handle_create_message(
        &self,
        server_key: &str,
        raw_params: Value,
    ) -> Result<Value, JsonRpcError> {
        // 1. parse
        let mut request: SamplingRequest = serde_json::from_value(raw_params)
            .map_err(|e| JsonRpcError::invalid_params(format!("malformed sampling request: {e}")))?;
        if request.messages.is_empty() {
            return Err(JsonRpcError::invalid_params("messages must not be empty"));
        }

        // 2. server permission
        if !self.config.server_allowlist.is_empty()
            && !self.config.server_allowlist.iter().any(|s| s == server_key)
        {
            return Err(JsonRpcError::invalid_request(format!(
                "server '{server_key}' is not in the sampling allowlist"
            )));
        }
        if self.config.server_denylist.iter().any(|s| s == server_key) {
            return Err(JsonRpcError::invalid_request(format!(
                "server '{server_key}' is denied from sampling"
            )));
        }

        // 3. rate limit -- checked, not yet recorded as consumed until we
        // know the request will actually proceed (it already was recorded
        // by `try_acquire` above the line; a request that is later denied
        // by the content filter still counted against quota, matching the
        // original's "count attempts, not just successes" intent).
        if !self.limiter.try_acquire(server_key) {
            return Err(JsonRpcError::invalid_request("sampling rate limit exceeded"));
        }

        // 4. token clamp
        let requested_tokens = request.max_tokens.unwrap_or(self.config.default_max_tokens);
        let clamped_tokens = requested_tokens.min(self.config.max_tokens_limit);
        if clamped_tokens != requested_tokens {
            info!(server_key, requested_tokens, clamped_tokens, "sampling max_tokens clamped");
        }
        request.max_tokens = Some(clamped_tokens);

        // 5. content filter
        if self.config.enable_content_filter && !self.config.blocked_keywords.is_empty() {
            let combined: String = request
                .messages
                .iter()
                .map(|m| m.content.as_text())
                .collect::<Vec<_>>()
                .join("\n")
                .to_lowercase();
            if let Some(hit) = self
                .config
                .blocked_keywords
                .iter()
                .find(|kw| combined.contains(&kw.to_lowercase()))
            {
                warn!(server_key, keyword = %hit, "sampling request blocked by content filter");
                return Err(JsonRpcError::invalid_request(format!(
                    "request content matched a blocked keyword: {hit}"
                )));
            }
        }

        // 6. approval decision
        let needs_approval = self.config.require_approval && clamped_tokens > self.config.auto_approve_token_threshold;
        if needs_approval {
            let id = Uuid::new_v4().to_string();
            let now = Utc::now();
            let expires_at = now + chrono::Duration::seconds(self.config.approval_timeout_secs as i64);
            self.inner.lock().pending.insert(
                id.clone(),
                PendingSamplingRequest {
                    id: id.clone(),
                    server_key: server_key.to_string(),
                    request,
                    created_at: now,
                    expires_at,
                },
            );
            info!(server_key, id = %id, "sampling request queued for approval");
            return Err(JsonRpcError::needs_approval(format!(
                "sampling request '{id}' requires human approval"
            )));
        }

        // 7. execute
        self.execute(server_key, &request).await
    }

    async fn execute(&self, server_key: &str, request: &SamplingRequest) -> Result<Value, JsonRpcError> {
        match self.executor.complete(request).await {
            Ok(response) => {
                serde_json::to_value(response).map_err(|e| JsonRpcError::internal(format!("encoding response: {e}")))
            }
            Err(e) => {
                warn!(server_key, error = %e, "sampling execution failed");
                Err(JsonRpcError::internal(format!("sampling execution failed: {e}")))
            }
        }
    }

    /// Approve a pending request and execute it; a second call against the
    /// same id, whether approve or reject, returns `NotFound` since the
    /// first call already consumed the pending entry. `modified_params` lets
    /// the approving operator override `maxTokens`/`temperature` on the
    /// queued request before it runs (spec.md §8 scenario 5), still subject
    /// to the same `max_tokens_limit` clamp the original request went
    /// through.
    pub async fn approve(&self, id: &str, modified_params: Option<Value>) -> crate::error::HostResult<Value> {
        let mut pending = {
            let mut inner = self.inner.lock();
            let Some(pending) = inner.pending.remove(id) else {
                return Err(crate::error::HostError::not_found(format!("pending sampling request '{id}'")));
            };
            if Utc::now() > pending.expires_at {
                inner.audit.push(SamplingAuditEntry {
                    id: pending.id.clone(),
                    server_key: pending.server_key.clone(),
                    outcome: "expired".to_string(),
                    created_at: pending.created_at,
                    resolved_at: Utc::now(),
                });
                Self::cap_audit(&mut inner.audit, self.audit_cap);
                return Err(crate::error::HostError::conflict(format!("pending sampling request '{id}' expired")));
            }
            pending
        };

        if let Some(overrides) = modified_params {
            if let Some(max_tokens) = overrides.get("maxTokens").or_else(|| overrides.get("max_tokens")).and_then(|v| v.as_u64()) {
                pending.request.max_tokens = Some((max_tokens as u32).min(self.config.max_tokens_limit));
            }
            if let Some(temperature) = overrides.get("temperature").and_then(|v| v.as_f64()) {
                pending.request.temperature = Some(temperature as f32);
            }
        }

        let result = self.execute(&pending.server_key, &pending.request).await;
        let mut inner = self.inner.lock();
        inner.audit.push(SamplingAuditEntry {
            id: pending.id.clone(),
            server_key: pending.server_key.clone(),
            outcome: if result.is_ok() { "approved".to_string() } else { "approved_but_failed".to_string() },
            created_at: pending.created_at,
            resolved_at: Utc::now(),
        });
        Self::cap_audit(&mut inner.audit, self.audit_cap);
        drop(inner);

        result.map_err(|e| crate::error::HostError::upstream(format!("{}: {}", e.code, e.message)))
    }

    pub fn reject(&self, id: &str, reason: &str) -> crate::error::HostResult<()> {
        let mut inner = self.inner.lock();
        let Some(pending) = inner.pending.remove(id) else {
            return Err(crate::error::HostError::not_found(format!("pending sampling request '{id}'")));
        };
        info!(id = %pending.id, reason, "sampling request rejected");
        inner.audit.push(SamplingAuditEntry {
            id: pending.id.clone(),
            server_key: pending.server_key.clone(),
            outcome: "rejected".to_string(),
            created_at: pending.created_at,
            resolved_at: Utc::now(),
        });
        Self::cap_audit(&mut inner.audit, self.audit_cap);
        Ok(())
    }

    fn cap_audit(audit: &mut Vec<SamplingAuditEntry>, cap: usize) {
        if audit.len() > cap {
            let excess = audit.len() - cap;
            audit.drain(0..excess);
        }
    }

    pub fn list_pending(&self) -> Vec<PendingSamplingRequest> {
        self.inner.lock().pending.values().cloned().collect()
    }

    pub fn audit_log(&self, limit: usize) -> Vec<SamplingAuditEntry> {
        let inner = self.inner.lock();
        let mut entries = inner.audit.clone();
        entries.sort_by(|a, b| b.resolved_at.cmp(&a.resolved_at));
        entries.truncate(limit);
        entries
    }

    /// Sweeps expired pending requests into the audit log. Intended to run
    /// on the same cadence as `HitlGate::spawn_sweep_task` (60s).
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let expired_ids: Vec<String> = inner
            .pending
            .values()
            .filter(|p| now > p.expires_at)
            .map(|p| p.id.clone())
            .collect();
        for id in expired_ids {
            if let Some(pending) = inner.pending.remove(&id) {
                warn!(id = %pending.id, "sampling request expired unapproved");
                inner.audit.push(SamplingAuditEntry {
                    id: pending.id,
                    server_key: pending.server_key,
                    outcome: "expired".to_string(),
                    created_at: pending.created_at,
                    resolved_at: now,
                });
            }
        }
        Self::cap_audit(&mut inner.audit, self.audit_cap);
    }

    pub fn spawn_sweep_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                service.sweep_expired();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl SamplingExecutor for EchoExecutor {
        async fn complete(&self, request: &SamplingRequest) -> Result<SamplingResponse, String> {
            Ok(SamplingResponse {
                role: "assistant".to_string(),
                content: SamplingContent::Text(format!("echo: {}", request.messages.len())),
                model: "fake-model".to_string(),
                stop_reason: Some(StopReason::EndTurn),
            })
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl SamplingExecutor for FailingExecutor {
        async fn complete(&self, _request: &SamplingRequest) -> Result<SamplingResponse, String> {
            Err("upstream unavailable".to_string())
        }
    }

    fn sample_params() -> Value {
        serde_json::json!({
            "messages": [{"role": "user", "content": "hello"}],
            "maxTokens": 50,
        })
    }

    #[tokio::test]
    async fn auto_approved_request_executes_directly() {
        let service = SamplingService::new(SamplingSecurityConfig::from_env(), Arc::new(EchoExecutor));
        let result = service.handle_create_message("srv", sample_params()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn empty_messages_is_invalid_params() {
        let service = SamplingService::new(SamplingSecurityConfig::from_env(), Arc::new(EchoExecutor));
        let result = service
            .handle_create_message("srv", serde_json::json!({"messages": []}))
            .await;
        assert_eq!(result.unwrap_err().code, -32602);
    }

    #[tokio::test]
    async fn denylisted_server_is_invalid_request() {
        let mut config = SamplingSecurityConfig::from_env();
        config.server_denylist = vec!["bad".to_string()];
        let service = SamplingService::new(config, Arc::new(EchoExecutor));
        let result = service.handle_create_message("bad", sample_params()).await;
        assert_eq!(result.unwrap_err().code, -32600);
    }

    #[tokio::test]
    async fn tokens_are_clamped_to_configured_limit() {
        let mut config = SamplingSecurityConfig::from_env();
        config.max_tokens_limit = 10;
        let service = SamplingService::new(config, Arc::new(EchoExecutor));
        let result = service.handle_create_message("srv", sample_params()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn content_filter_blocks_matching_keyword() {
        let mut config = SamplingSecurityConfig::from_env();
        config.blocked_keywords = vec!["forbidden".to_string()];
        let service = SamplingService::new(config, Arc::new(EchoExecutor));
        let params = serde_json::json!({"messages": [{"role": "user", "content": "this is forbidden content"}]});
        let result = service.handle_create_message("srv", params).await;
        assert_eq!(result.unwrap_err().code, -32600);
    }

    #[tokio::test]
    async fn requires_approval_queues_and_returns_needs_approval_code() {
        let mut config = SamplingSecurityConfig::from_env();
        config.require_approval = true;
        config.auto_approve_token_threshold = 1;
        let service = SamplingService::new(config, Arc::new(EchoExecutor));
        let result = service.handle_create_message("srv", sample_params()).await;
        assert_eq!(result.unwrap_err().code, -32001);
        assert_eq!(service.list_pending().len(), 1);
    }

    #[tokio::test]
    async fn approve_with_modified_params_overrides_max_tokens() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct RecordingExecutor {
            seen_max_tokens: Arc<AtomicU32>,
        }

        #[async_trait]
        impl SamplingExecutor for RecordingExecutor {
            async fn complete(&self, request: &SamplingRequest) -> Result<SamplingResponse, String> {
                self.seen_max_tokens.store(request.max_tokens.unwrap_or(0), Ordering::SeqCst);
                Ok(SamplingResponse {
                    role: "assistant".to_string(),
                    content: SamplingContent::Text("ok".to_string()),
                    model: "fake-model".to_string(),
                    stop_reason: Some(StopReason::EndTurn),
                })
            }
        }

        let mut config = SamplingSecurityConfig::from_env();
        config.require_approval = true;
        config.auto_approve_token_threshold = 100;
        config.max_tokens_limit = 4096;
        let seen = Arc::new(AtomicU32::new(0));
        let service = SamplingService::new(
            config,
            Arc::new(RecordingExecutor { seen_max_tokens: seen.clone() }),
        );

        let params = serde_json::json!({
            "messages": [{"role": "user", "content": "hello"}],
            "maxTokens": 512,
        });
        let result = service.handle_create_message("weather", params).await;
        assert_eq!(result.unwrap_err().code, -32001);

        let pending = service.list_pending();
        let id = pending[0].id.clone();
        let approved = service
            .approve(&id, Some(serde_json::json!({"maxTokens": 256})))
            .await;
        assert!(approved.is_ok());
        assert_eq!(seen.load(Ordering::SeqCst), 256);
    }

    #[tokio::test]
    async fn approve_then_reject_same_id_is_not_found_on_second_call() {
        let mut config = SamplingSecurityConfig::from_env();
        config.require_approval = true;
        config.auto_approve_token_threshold = 1;
        let service = SamplingService::new(config, Arc::new(EchoExecutor));
        let _ = service.handle_create_message("srv", sample_params()).await;
        let pending = service.list_pending();
        let id = pending[0].id.clone();

        assert!(service.approve(&id, None).await.is_ok());
        let second = service.reject(&id, "too late");
        assert!(matches!(second, Err(crate::error::HostError::NotFound(_))));
    }

    #[tokio::test]
    async fn failing_executor_surfaces_as_internal_error() {
        let service = SamplingService::new(SamplingSecurityConfig::from_env(), Arc::new(FailingExecutor));
        let result = service.handle_create_message("srv", sample_params()).await;
        assert_eq!(result.unwrap_err().code, -32603);
    }

    #[test]
    fn rate_limit_exceeded_is_invalid_request() {
        let mut config = SamplingSecurityConfig::from_env();
        config.rate_limit_per_minute = 1;
        let service = SamplingService::new(config, Arc::new(EchoExecutor));
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let _ = service.handle_create_message("srv", sample_params()).await;
            let second = service.handle_create_message("srv", sample_params()).await;
            assert_eq!(second.unwrap_err().code, -32600);
        });
    }
}

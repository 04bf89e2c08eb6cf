// src/hitl/mod.rs
// Human-in-the-loop gate (spec.md §4.C): holds, times out, approves,
// modifies or rejects tool calls before they execute.
//
// Grounded on `examples/original_source/backend/app/services/human_in_loop.py`
// for the exact state machine, timeout default, and audit-log semantics; the
// 60s sweep-as-background-task pattern mirrors `sudo/service.rs`'s cleanup
// task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::HitlPolicyConfig;
use crate::error::{HostError, HostResult};
use crate::risk::{ConfirmationPolicy, RiskLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
    Expired,
}

/// The subset of a `ToolCallRequest` the HITL gate needs; the full request
/// type lives in `host.rs` and is threaded through opaquely here.
#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub request_id: String,
    pub session_id: String,
    pub server_key: String,
    pub tool_local_name: String,
    pub public_tool_name: String,
    pub arguments: Value,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub id: String,
    pub session_id: String,
    pub tool_call: PendingToolCall,
    pub risk_level: RiskLevel,
    pub status: ConfirmationStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub modified_arguments: Option<Value>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// UI-facing rendering of a confirmation request.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationView {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub server_key: String,
    pub arguments: Value,
    pub risk_level: String,
    pub risk_description: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub time_remaining_seconds: i64,
    pub allow_modification: bool,
    pub require_double_confirmation: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: String,
    pub tool_name: String,
    pub risk_level: String,
    pub status: String,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub was_modified: bool,
}

struct Inner {
    pending: HashMap<String, ConfirmationRequest>,
    completed: Vec<ConfirmationRequest>,
}

/// Holds pending and completed confirmation requests, applies the
/// whitelist/blacklist/risk-level policy, and sweeps expirations.
pub struct HitlGate {
    inner: Mutex<Inner>,
    pub policy: ConfirmationPolicy,
    timeout: Duration,
    allow_modification: bool,
    require_double_confirmation: bool,
    audit_cap: usize,
}

impl HitlGate {
    pub fn new(config: &HitlPolicyConfig) -> Self {
        let policy = ConfirmationPolicy {
            confirmation_levels: config.confirmation_levels.iter().copied().collect(),
            whitelisted_tools: config.whitelisted_tools.iter().cloned().collect(),
            blacklisted_tools: config.blacklisted_tools.iter().cloned().collect(),
        };
        Self {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                completed: Vec::new(),
            }),
            policy,
            timeout: Duration::from_secs(config.confirmation_timeout_secs),
            allow_modification: config.allow_modification,
            require_double_confirmation: config.require_double_confirmation,
            audit_cap: 1000,
        }
    }

    pub fn needs_confirmation(&self, public_tool_name: &str, level: RiskLevel) -> bool {
        self.policy.needs_confirmation(public_tool_name, level)
    }

    pub fn create(&self, tool_call: PendingToolCall) -> ConfirmationRequest {
        let now = Utc::now();
        let request = ConfirmationRequest {
            id: Uuid::new_v4().to_string(),
            session_id: tool_call.session_id.clone(),
            risk_level: tool_call.risk_level,
            tool_call,
            status: ConfirmationStatus::Pending,
            approved_by: None,
            approved_at: None,
            modified_arguments: None,
            rejection_reason: None,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(self.timeout).unwrap_or_default(),
        };
        info!(request_id = %request.id, tool = %request.tool_call.public_tool_name, "created confirmation request");
        self.inner.lock().pending.insert(request.id.clone(), request.clone());
        request
    }

    pub fn approve(
        &self,
        id: &str,
        approved_by: &str,
        modified_arguments: Option<Value>,
    ) -> HostResult<ConfirmationRequest> {
        let mut inner = self.inner.lock();
        let mut request = inner
            .pending
            .remove(id)
            .ok_or_else(|| HostError::not_found(format!("confirmation request {id}")))?;

        if request.status != ConfirmationStatus::Pending {
            inner.pending.insert(id.to_string(), request);
            return Err(HostError::conflict(format!("request {id} is not pending")));
        }

        if Utc::now() > request.expires_at {
            request.status = ConfirmationStatus::Expired;
            inner.completed.push(request.clone());
            return Err(HostError::conflict(format!("request {id} has expired")));
        }

        if let Some(args) = modified_arguments {
            request.status = ConfirmationStatus::Modified;
            request.modified_arguments = Some(args.clone());
            request.tool_call.arguments = args;
        } else {
            request.status = ConfirmationStatus::Approved;
        }
        request.approved_by = Some(approved_by.to_string());
        request.approved_at = Some(Utc::now());

        inner.completed.push(request.clone());
        self.cap_audit(&mut inner);
        info!(request_id = %id, approved_by, "confirmation request approved");
        Ok(request)
    }

    pub fn reject(&self, id: &str, rejected_by: &str, reason: &str) -> HostResult<ConfirmationRequest> {
        let mut inner = self.inner.lock();
        let mut request = inner
            .pending
            .remove(id)
            .ok_or_else(|| HostError::not_found(format!("confirmation request {id}")))?;

        if request.status != ConfirmationStatus::Pending {
            inner.pending.insert(id.to_string(), request);
            return Err(HostError::conflict(format!("request {id} is not pending")));
        }

        request.status = ConfirmationStatus::Rejected;
        request.approved_by = Some(rejected_by.to_string());
        request.approved_at = Some(Utc::now());
        request.rejection_reason = Some(reason.to_string());

        inner.completed.push(request.clone());
        self.cap_audit(&mut inner);
        info!(request_id = %id, rejected_by, reason, "confirmation request rejected");
        Ok(request)
    }

    fn cap_audit(&self, inner: &mut Inner) {
        if inner.completed.len() > self.audit_cap {
            let excess = inner.completed.len() - self.audit_cap;
            inner.completed.drain(0..excess);
        }
    }

    pub fn get(&self, id: &str) -> Option<ConfirmationRequest> {
        let inner = self.inner.lock();
        inner
            .pending
            .get(id)
            .cloned()
            .or_else(|| inner.completed.iter().rev().find(|r| r.id == id).cloned())
    }

    /// Pending requests sorted by creation time, optionally filtered by session.
    pub fn list_pending(&self, session_id: Option<&str>) -> Vec<ConfirmationRequest> {
        let inner = self.inner.lock();
        let mut items: Vec<_> = inner
            .pending
            .values()
            .filter(|r| session_id.map(|s| s == r.session_id).unwrap_or(true))
            .cloned()
            .collect();
        items.sort_by_key(|r| r.created_at);
        items
    }

    pub fn format_for_ui(&self, request: &ConfirmationRequest) -> ConfirmationView {
        let remaining = if request.status == ConfirmationStatus::Pending {
            (request.expires_at - Utc::now()).num_seconds().max(0)
        } else {
            0
        };
        ConfirmationView {
            id: request.id.clone(),
            session_id: request.session_id.clone(),
            tool_name: request.tool_call.public_tool_name.clone(),
            server_key: request.tool_call.server_key.clone(),
            arguments: request.tool_call.arguments.clone(),
            risk_level: request.risk_level.as_str().to_string(),
            risk_description: request.risk_level.description().to_string(),
            status: status_str(request.status).to_string(),
            created_at: request.created_at,
            expires_at: request.expires_at,
            time_remaining_seconds: remaining,
            allow_modification: self.allow_modification,
            require_double_confirmation: self.require_double_confirmation
                && request.risk_level == RiskLevel::Critical,
        }
    }

    pub fn get_audit_log(&self, session_id: Option<&str>, limit: usize) -> Vec<AuditEntry> {
        let inner = self.inner.lock();
        let mut items: Vec<_> = inner
            .completed
            .iter()
            .filter(|r| session_id.map(|s| s == r.session_id).unwrap_or(true))
            .cloned()
            .collect();
        items.sort_by_key(|r| std::cmp::Reverse(r.approved_at.unwrap_or(r.created_at)));
        items.truncate(limit);
        items
            .into_iter()
            .map(|r| AuditEntry {
                id: r.id,
                tool_name: r.tool_call.public_tool_name,
                risk_level: r.risk_level.as_str().to_string(),
                status: status_str(r.status).to_string(),
                approved_by: r.approved_by,
                approved_at: r.approved_at,
                rejection_reason: r.rejection_reason,
                was_modified: r.status == ConfirmationStatus::Modified,
            })
            .collect()
    }

    /// Sweep expired pending requests. Called every 60s by the background
    /// task spawned in `spawn_sweep_task`.
    fn sweep_expired(&self) {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let expired_ids: Vec<String> = inner
            .pending
            .iter()
            .filter(|(_, r)| now > r.expires_at)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired_ids {
            if let Some(mut request) = inner.pending.remove(&id) {
                request.status = ConfirmationStatus::Expired;
                warn!(request_id = %id, "confirmation request expired");
                inner.completed.push(request);
            }
        }
        self.cap_audit(&mut inner);
    }

    /// Spawn the 60-second sweep task. The returned handle should be kept
    /// by the owner (`Host`) and aborted on `cleanup_all`.
    pub fn spawn_sweep_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let gate = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                gate.sweep_expired();
            }
        })
    }
}

fn status_str(status: ConfirmationStatus) -> &'static str {
    match status {
        ConfirmationStatus::Pending => "pending",
        ConfirmationStatus::Approved => "approved",
        ConfirmationStatus::Rejected => "rejected",
        ConfirmationStatus::Modified => "modified",
        ConfirmationStatus::Expired => "expired",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate() -> HitlGate {
        HitlGate::new(&HitlPolicyConfig {
            confirmation_levels: vec![RiskLevel::High, RiskLevel::Critical],
            confirmation_timeout_secs: 300,
            allow_modification: true,
            require_double_confirmation: true,
            whitelisted_tools: Vec::new(),
            blacklisted_tools: Vec::new(),
        })
    }

    fn call(name: &str, level: RiskLevel) -> PendingToolCall {
        PendingToolCall {
            request_id: Uuid::new_v4().to_string(),
            session_id: "s1".to_string(),
            server_key: "fs".to_string(),
            tool_local_name: name.to_string(),
            public_tool_name: format!("fs__{name}"),
            arguments: json!({"path": "/tmp/x"}),
            risk_level: level,
        }
    }

    #[test]
    fn create_then_approve_moves_to_completed() {
        let g = gate();
        let req = g.create(call("write_file", RiskLevel::High));
        let approved = g.approve(&req.id, "user", None).unwrap();
        assert_eq!(approved.status, ConfirmationStatus::Approved);
        assert!(g.list_pending(None).is_empty());
    }

    #[test]
    fn approve_with_modified_args_sets_modified_status() {
        let g = gate();
        let req = g.create(call("write_file", RiskLevel::High));
        let modified = g
            .approve(&req.id, "user", Some(json!({"path": "/safe/x"})))
            .unwrap();
        assert_eq!(modified.status, ConfirmationStatus::Modified);
        assert_eq!(modified.tool_call.arguments, json!({"path": "/safe/x"}));
    }

    #[test]
    fn reject_sets_reason() {
        let g = gate();
        let req = g.create(call("delete_file", RiskLevel::Critical));
        let rejected = g.reject(&req.id, "user", "too risky").unwrap();
        assert_eq!(rejected.status, ConfirmationStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("too risky"));
    }

    #[test]
    fn approving_twice_fails_on_second_call() {
        let g = gate();
        let req = g.create(call("write_file", RiskLevel::High));
        g.approve(&req.id, "user", None).unwrap();
        let second = g.approve(&req.id, "user", None);
        assert!(matches!(second, Err(HostError::NotFound(_))));
    }

    #[test]
    fn approve_then_reject_second_call_is_not_found() {
        let g = gate();
        let req = g.create(call("write_file", RiskLevel::High));
        g.approve(&req.id, "user", None).unwrap();
        let rejected = g.reject(&req.id, "user", "changed my mind");
        assert!(matches!(rejected, Err(HostError::NotFound(_))));
    }

    #[test]
    fn list_pending_sorted_by_creation_time() {
        let g = gate();
        let a = g.create(call("write_file", RiskLevel::High));
        let b = g.create(call("delete_file", RiskLevel::Critical));
        let list = g.list_pending(None);
        assert_eq!(list[0].id, a.id);
        assert_eq!(list[1].id, b.id);
    }

    #[test]
    fn require_double_confirmation_true_only_for_critical() {
        let g = gate();
        let high_req = g.create(call("write_file", RiskLevel::High));
        let view = g.format_for_ui(&high_req);
        assert!(!view.require_double_confirmation);

        let critical_req = g.create(call("delete_file", RiskLevel::Critical));
        let view = g.format_for_ui(&critical_req);
        assert!(view.require_double_confirmation);
    }

    #[test]
    fn needs_confirmation_defaults_to_high_and_critical() {
        let g = gate();
        assert!(!g.needs_confirmation("fs__list_files", RiskLevel::Medium));
        assert!(g.needs_confirmation("fs__write_file", RiskLevel::High));
    }

    #[test]
    fn audit_log_contains_terminal_requests_only() {
        let g = gate();
        let pending = g.create(call("read_file", RiskLevel::Low));
        let req = g.create(call("write_file", RiskLevel::High));
        g.approve(&req.id, "user", None).unwrap();
        let audit = g.get_audit_log(None, 100);
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].id, req.id);
        assert_ne!(audit[0].id, pending.id);
    }
}

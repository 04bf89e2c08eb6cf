// src/mcp/transport.rs
// Shared JSON-RPC request/response plumbing used by both the stdio and SSE
// session managers: a monotonic request-id counter and a pending-responses
// map keyed by that id.
//
// Generalizes `backend/src/mcp/transport.rs`'s single-request-response
// `StdioTransport::send` into the listener-task + pending-id-map design
// spec.md §4.D/§9 require. Cancellation safety (§9 "the pending future must
// be cancellation-safe: cancelling the caller must remove the entry, not
// leak it") is implemented with `tokio::sync::oneshot`: a `PendingResponseGuard`
// removes its own map entry on drop, so a cancelled `.await` never leaks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::protocol::JsonRpcError;

pub type RpcResult = Result<serde_json::Value, JsonRpcError>;

/// Monotonic JSON-RPC request id generator, shared by one session.
#[derive(Default)]
pub struct RequestIdCounter(AtomicI64);

impl RequestIdCounter {
    pub fn new() -> Self {
        Self(AtomicI64::new(1))
    }

    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// Map of in-flight request ids to the oneshot sender that resolves them.
pub struct PendingResponses {
    map: Mutex<HashMap<i64, oneshot::Sender<RpcResult>>>,
}

impl PendingResponses {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: Mutex::new(HashMap::new()),
        })
    }

    /// Register a new in-flight request, returning a guard whose `wait()`
    /// resolves when `resolve`/`fail_all` is called for this id, and which
    /// removes its own map entry when dropped before resolution.
    pub fn register(self: &Arc<Self>, id: i64) -> PendingResponseGuard {
        let (tx, rx) = oneshot::channel();
        self.map.lock().insert(id, tx);
        PendingResponseGuard {
            id,
            registry: self.clone(),
            receiver: Some(rx),
        }
    }

    /// Resolve a pending request by id. Returns `false` if no such request
    /// was in flight (e.g. it already timed out and was dropped).
    pub fn resolve(&self, id: i64, result: RpcResult) -> bool {
        if let Some(tx) = self.map.lock().remove(&id) {
            tx.send(result).is_ok()
        } else {
            false
        }
    }

    /// Fail every in-flight request, e.g. on transport shutdown.
    pub fn fail_all(&self, error: JsonRpcError) {
        let mut map = self.map.lock();
        for (_, tx) in map.drain() {
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.map.lock().len()
    }
}

pub struct PendingResponseGuard {
    id: i64,
    registry: Arc<PendingResponses>,
    receiver: Option<oneshot::Receiver<RpcResult>>,
}

impl PendingResponseGuard {
    pub async fn wait(mut self) -> Result<RpcResult, oneshot::error::RecvError> {
        self.receiver.take().expect("wait called once").await
    }

    pub fn id(&self) -> i64 {
        self.id
    }
}

impl Drop for PendingResponseGuard {
    fn drop(&mut self) {
        // If the receiver was already consumed by `wait`, the map entry was
        // already removed by whichever side resolved it; this is then a
        // no-op. If the guard is dropped without `wait` completing (the
        // caller cancelled), remove the entry so it doesn't leak forever.
        self.registry.map.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_id_counter_is_monotonic() {
        let counter = RequestIdCounter::new();
        let a = counter.next();
        let b = counter.next();
        assert!(b > a);
    }

    #[tokio::test]
    async fn resolve_delivers_to_waiting_guard() {
        let responses = PendingResponses::new();
        let guard = responses.register(1);
        assert!(responses.resolve(1, Ok(json!({"ok": true}))));
        let result = guard.wait().await.unwrap();
        assert_eq!(result.unwrap(), json!({"ok": true}));
    }

    #[test]
    fn resolve_unknown_id_returns_false() {
        let responses = PendingResponses::new();
        assert!(!responses.resolve(99, Ok(json!(null))));
    }

    #[test]
    fn dropping_guard_without_waiting_removes_entry() {
        let responses = PendingResponses::new();
        {
            let _guard = responses.register(1);
            assert_eq!(responses.in_flight_count(), 1);
        }
        assert_eq!(responses.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn fail_all_resolves_every_pending_with_error() {
        let responses = PendingResponses::new();
        let g1 = responses.register(1);
        let g2 = responses.register(2);
        responses.fail_all(JsonRpcError::internal("shutting down"));
        assert!(g1.wait().await.unwrap().is_err());
        assert!(g2.wait().await.unwrap().is_err());
    }
}

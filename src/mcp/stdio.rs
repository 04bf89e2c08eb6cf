// src/mcp/stdio.rs
// Stdio MCP session manager (spec.md §4.D): spawns a child process per
// server_key, frames JSON-RPC as newline-delimited JSON, and runs a listener
// task that routes responses to pending callers, server-initiated requests
// to the `ServerRequestHandler`, and notifications to a cache refresh.
//
// Generalizes `backend/src/mcp/transport.rs::StdioTransport` (spawn,
// kill_on_drop, stderr-drain task) from its synchronous single-request model
// into the listener-task + pending-id-map design required by spec.md §4.D
// and §9. Exact handshake sequence and RPC method names come from
// `examples/original_source/backend/app/services/stdio_mcp_manager.py`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::transport::{PendingResponses, RequestIdCounter};
use super::{CapabilityCatalogue, ServerRequestHandler, SessionStatus, TransportKind};
use crate::error::{HostError, HostResult};
use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpCapabilities};

/// Consecutive malformed-frame threshold before a session is treated as a
/// transport error (SPEC_FULL.md §13 resolution #4).
const MALFORMED_FRAME_THRESHOLD: u32 = 5;

pub struct StdioSessionConfig {
    pub server_key: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub handshake_timeout: Duration,
}

/// One spawned MCP server reached over stdio.
pub struct StdioSession {
    pub server_key: String,
    child: AsyncMutex<Child>,
    stdin: AsyncMutex<tokio::process::ChildStdin>,
    ids: RequestIdCounter,
    pending: Arc<PendingResponses>,
    catalogue: RwLock<CapabilityCatalogue>,
    server_info: RwLock<Option<Value>>,
    alive: AtomicBool,
    malformed_count: AtomicU32,
    listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StdioSession {
    /// Spawn the child process and start its stdout listener task. Does
    /// *not* run the initialize handshake — call `initialize()` next.
    pub async fn spawn(
        config: &StdioSessionConfig,
        handler: Arc<dyn ServerRequestHandler>,
    ) -> HostResult<Arc<Self>> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &config.env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| HostError::transport(format!("failed to spawn '{}': {e}", config.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::transport("failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::transport("failed to capture stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            let server_key = config.server_key.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                while let Ok(n) = reader.read_line(&mut line).await {
                    if n == 0 {
                        break;
                    }
                    debug!(server_key = %server_key, "[stderr] {}", line.trim());
                    line.clear();
                }
            });
        }

        let session = Arc::new(Self {
            server_key: config.server_key.clone(),
            child: AsyncMutex::new(child),
            stdin: AsyncMutex::new(stdin),
            ids: RequestIdCounter::new(),
            pending: PendingResponses::new(),
            catalogue: RwLock::new(CapabilityCatalogue::default()),
            server_info: RwLock::new(None),
            alive: AtomicBool::new(true),
            malformed_count: AtomicU32::new(0),
            listener: Mutex::new(None),
        });

        let listener_session = session.clone();
        let handle = tokio::spawn(async move {
            listener_session.run_listener(BufReader::new(stdout), handler).await;
        });
        *session.listener.lock() = Some(handle);

        Ok(session)
    }

    /// Standard MCP handshake: `initialize` -> `notifications/initialized`
    /// -> one each of `tools/list`, `resources/list`, `prompts/list`, each
    /// tolerant of failure (the session stays usable if any of the three
    /// catalogue calls fails).
    pub async fn initialize(&self, handshake_timeout: Duration, sampling_enabled: bool) -> HostResult<()> {
        let params = json!({
            "protocolVersion": crate::protocol::MCP_PROTOCOL_VERSION,
            "capabilities": McpCapabilities::client_default(sampling_enabled),
            "clientInfo": { "name": "mcp-host", "version": env!("CARGO_PKG_VERSION") },
        });

        let result = tokio::time::timeout(handshake_timeout, self.call("initialize", Some(params)))
            .await
            .map_err(|_| HostError::Timeout(handshake_timeout))??;
        *self.server_info.write() = Some(result);

        self.notify("notifications/initialized", None).await?;

        if let Ok(result) = self.call("tools/list", None).await {
            if let Some(tools) = result.get("tools") {
                if let Ok(tools) = serde_json::from_value(tools.clone()) {
                    self.catalogue.write().tools = tools;
                }
            }
        } else {
            warn!(server_key = %self.server_key, "tools/list failed during handshake, continuing");
        }

        if let Ok(result) = self.call("resources/list", None).await {
            if let Some(resources) = result.get("resources") {
                if let Ok(resources) = serde_json::from_value(resources.clone()) {
                    self.catalogue.write().resources = resources;
                }
            }
        } else {
            warn!(server_key = %self.server_key, "resources/list failed during handshake, continuing");
        }

        if let Ok(result) = self.call("prompts/list", None).await {
            if let Some(prompts) = result.get("prompts") {
                if let Ok(prompts) = serde_json::from_value(prompts.clone()) {
                    self.catalogue.write().prompts = prompts;
                }
            }
        } else {
            warn!(server_key = %self.server_key, "prompts/list failed during handshake, continuing");
        }

        Ok(())
    }

    async fn write_line(&self, line: &str) -> HostResult<()> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| HostError::transport(format!("stdin write failed: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| HostError::transport(format!("stdin newline failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| HostError::transport(format!("stdin flush failed: {e}")))
    }

    /// Send a JSON-RPC request and await its correlated response.
    pub async fn call(&self, method: &str, params: Option<Value>) -> HostResult<Value> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(HostError::transport(format!(
                "session '{}' is no longer alive",
                self.server_key
            )));
        }
        let id = self.ids.next();
        let request = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&request)?;
        let guard = self.pending.register(id);
        self.write_line(&line).await?;

        match guard.wait().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(HostError::Upstream(format!("{}: {}", err.code, err.message))),
            Err(_) => Err(HostError::transport("connection closed before response arrived")),
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> HostResult<()> {
        let notification = JsonRpcRequest::notification(method, params);
        let line = serde_json::to_string(&notification)?;
        self.write_line(&line).await
    }

    async fn run_listener(self: Arc<Self>, mut stdout: BufReader<tokio::process::ChildStdout>, handler: Arc<dyn ServerRequestHandler>) {
        let mut line = String::new();
        loop {
            line.clear();
            let n = match stdout.read_line(&mut line).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(server_key = %self.server_key, "stdout read error: {e}");
                    break;
                }
            };
            if n == 0 {
                info!(server_key = %self.server_key, "child closed stdout, session ending");
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => {
                    self.malformed_count.store(0, Ordering::SeqCst);
                    self.route_message(value, &handler).await;
                }
                Err(e) => {
                    let count = self.malformed_count.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(server_key = %self.server_key, error = %e, count, "malformed JSON-RPC frame on stdout");
                    if count >= MALFORMED_FRAME_THRESHOLD {
                        warn!(server_key = %self.server_key, "malformed-frame threshold exceeded, tearing down session");
                        break;
                    }
                }
            }
        }

        self.alive.store(false, Ordering::SeqCst);
        self.pending
            .fail_all(JsonRpcError::internal("stdio session closed"));
    }

    async fn route_message(&self, value: Value, handler: &Arc<dyn ServerRequestHandler>) {
        let has_id = value.get("id").is_some();
        let has_method = value.get("method").is_some();

        if has_id && !has_method {
            // Response to one of our outbound requests.
            if let Ok(response) = serde_json::from_value::<JsonRpcResponse>(value) {
                let Some(id) = response.id else { return };
                if let Some(error) = response.error {
                    self.pending.resolve(id, Err(error));
                } else {
                    self.pending.resolve(id, Ok(response.result.unwrap_or(Value::Null)));
                }
            }
            return;
        }

        let method = value.get("method").and_then(|m| m.as_str()).unwrap_or_default();

        if has_id {
            // Server-initiated request: we must reply.
            let id = value.get("id").and_then(|v| v.as_i64());
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            let response = match method {
                "roots/list" => {
                    let result = handler.handle_roots_list(&self.server_key).await;
                    JsonRpcResponse::success(id.unwrap_or(0), result)
                }
                "sampling/createMessage" => {
                    match handler.handle_sampling_create_message(&self.server_key, params).await {
                        Ok(result) => JsonRpcResponse::success(id.unwrap_or(0), result),
                        Err(err) => JsonRpcResponse::failure(id, err),
                    }
                }
                other => {
                    warn!(server_key = %self.server_key, method = other, "unsupported server-initiated request");
                    JsonRpcResponse::failure(id, JsonRpcError::invalid_request(format!("unsupported method '{other}'")))
                }
            };
            if let Ok(line) = serde_json::to_string(&response) {
                let _ = self.write_line(&line).await;
            }
            return;
        }

        // Notification.
        match method {
            "notifications/tools/list_changed" => self.refresh_tools().await,
            "notifications/resources/list_changed" => self.refresh_resources().await,
            "notifications/prompts/list_changed" => self.refresh_prompts().await,
            "notifications/message" => {
                info!(server_key = %self.server_key, "server message: {:?}", value.get("params"));
            }
            other => debug!(server_key = %self.server_key, method = other, "unhandled notification"),
        }
    }

    async fn refresh_tools(&self) {
        if let Ok(result) = self.call("tools/list", None).await {
            if let Some(tools) = result.get("tools").and_then(|t| serde_json::from_value(t.clone()).ok()) {
                self.catalogue.write().tools = tools;
            }
        }
    }

    async fn refresh_resources(&self) {
        if let Ok(result) = self.call("resources/list", None).await {
            if let Some(resources) = result
                .get("resources")
                .and_then(|r| serde_json::from_value(r.clone()).ok())
            {
                self.catalogue.write().resources = resources;
            }
        }
    }

    async fn refresh_prompts(&self) {
        if let Ok(result) = self.call("prompts/list", None).await {
            if let Some(prompts) = result
                .get("prompts")
                .and_then(|p| serde_json::from_value(p.clone()).ok())
            {
                self.catalogue.write().prompts = prompts;
            }
        }
    }

    pub fn catalogue(&self) -> CapabilityCatalogue {
        self.catalogue.read().clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SessionStatus {
        let catalogue = self.catalogue.read();
        SessionStatus {
            server_key: self.server_key.clone(),
            transport: TransportKind::Stdio,
            alive: self.is_alive(),
            tool_count: catalogue.tools.len(),
            resource_count: catalogue.resources.len(),
            prompt_count: catalogue.prompts.len(),
        }
    }

    /// Graceful shutdown: SIGTERM, wait up to 5s, else SIGKILL. Any
    /// remaining pending futures are failed with a closed-connection error.
    pub async fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);

        let mut child = self.child.lock().await;
        send_terminate(&child);

        let graceful = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
        if graceful.is_err() {
            warn!(server_key = %self.server_key, "graceful stop timed out, sending SIGKILL");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        self.pending
            .fail_all(JsonRpcError::internal("session stopped"));
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is a valid process id we own (the child we spawned).
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {
    // No portable graceful-termination signal off Unix; the 5s grace wait
    // in `stop()` still applies before falling back to a hard kill.
}

/// Owns every stdio session, keyed by server_key.
pub struct StdioSessionManager {
    sessions: RwLock<HashMap<String, Arc<StdioSession>>>,
}

impl Default for StdioSessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioSessionManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn start_server(
        &self,
        config: StdioSessionConfig,
        handshake_timeout: Duration,
        sampling_enabled: bool,
        handler: Arc<dyn ServerRequestHandler>,
    ) -> HostResult<()> {
        if self.sessions.read().contains_key(&config.server_key) {
            return Err(HostError::conflict(format!(
                "server '{}' is already running",
                config.server_key
            )));
        }

        let server_key = config.server_key.clone();
        let session = StdioSession::spawn(&config, handler).await?;
        session.initialize(handshake_timeout, sampling_enabled).await?;
        self.sessions.write().insert(server_key, session);
        Ok(())
    }

    pub async fn stop_server(&self, server_key: &str) -> HostResult<()> {
        let session = self
            .sessions
            .write()
            .remove(server_key)
            .ok_or_else(|| HostError::not_found(format!("stdio server '{server_key}'")))?;
        session.stop().await;
        Ok(())
    }

    pub fn get(&self, server_key: &str) -> Option<Arc<StdioSession>> {
        self.sessions.read().get(server_key).cloned()
    }

    /// Sessions that are initialized and still alive, for aggregation.
    pub fn live_sessions(&self) -> Vec<Arc<StdioSession>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_alive())
            .cloned()
            .collect()
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.sessions.read().values().map(|s| s.status()).collect()
    }

    pub async fn stop_all(&self) {
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, v)| v).collect();
        for session in sessions {
            session.stop().await;
        }
    }
}

// src/mcp/sse.rs
// SSE MCP session manager (spec.md §4.E): a long-lived GET stream carries
// server -> client traffic (responses and server-initiated requests), while
// an independent POST channel carries client -> server requests. The POST's
// 2xx response is not the JSON-RPC response; that arrives later on the SSE
// stream, correlated by id through the shared `PendingResponses` map.
//
// Grounded on `backend/src/mcp/transport.rs` for the reqwest client setup
// and auth-header plumbing, generalized from single-shot HTTP calls to a
// persistent stream reader. The line-oriented SSE field parser follows the
// `text/event-stream` grammar directly (no existing teacher code parses SSE,
// so this is built from the wire format in spec.md §6.3/§4.E).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::RwLock;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::transport::{PendingResponses, RequestIdCounter};
use super::{CapabilityCatalogue, ServerRequestHandler, SessionStatus, TransportKind};
use crate::config::SseAuth;
use crate::error::{HostError, HostResult};
use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpCapabilities};

/// Linear reconnect backoff: 1s, 2s, 3s, ... capped at `MAX_BACKOFF`.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct SseSessionConfig {
    pub server_key: String,
    pub base_url: String,
    pub sse_endpoint: String,
    pub message_endpoint: String,
    pub auth: SseAuth,
    /// Shared across every session and every LLM backend (spec.md §5: "one
    /// HTTP client is shared across LLM calls and SSE"), not constructed
    /// per-session.
    pub client: Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// One SSE-reached MCP server.
pub struct SseSession {
    pub server_key: String,
    client: Client,
    base_url: String,
    sse_url: String,
    message_url: String,
    auth: SseAuth,
    ids: RequestIdCounter,
    pending: Arc<PendingResponses>,
    catalogue: RwLock<CapabilityCatalogue>,
    server_info: RwLock<Option<Value>>,
    state: RwLock<ConnectionState>,
    alive: AtomicBool,
    listener: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    /// Reconnect delay most recently advertised by the server via a `retry:`
    /// SSE field (spec.md §4.E: "If the server sends a `retry:` field, that
    /// overrides the default"), consulted by `run_reconnect_loop` in place
    /// of the linear backoff ladder once set.
    retry_hint: RwLock<Option<Duration>>,
}

impl SseSession {
    pub fn new(config: &SseSessionConfig) -> Arc<Self> {
        let sse_url = join_url(&config.base_url, &config.sse_endpoint);
        let message_url = join_url(&config.base_url, &config.message_endpoint);
        Arc::new(Self {
            server_key: config.server_key.clone(),
            client: config.client.clone(),
            base_url: config.base_url.clone(),
            sse_url,
            message_url,
            auth: config.auth.clone(),
            ids: RequestIdCounter::new(),
            pending: PendingResponses::new(),
            catalogue: RwLock::new(CapabilityCatalogue::default()),
            server_info: RwLock::new(None),
            state: RwLock::new(ConnectionState::Connecting),
            alive: AtomicBool::new(false),
            listener: AsyncMutex::new(None),
            retry_hint: RwLock::new(None),
        })
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            SseAuth::None => builder,
            SseAuth::Bearer { token } => builder.bearer_auth(token),
            SseAuth::ApiKey { header, value } => builder.header(header, value),
            SseAuth::Custom { header, value } => builder.header(header, value),
        }
    }

    /// Start the GET stream listener task and run the initialize handshake.
    pub async fn connect(
        self: &Arc<Self>,
        handshake_timeout: Duration,
        sampling_enabled: bool,
        handler: Arc<dyn ServerRequestHandler>,
    ) -> HostResult<()> {
        let session = self.clone();
        let handle = tokio::spawn(async move {
            session.run_reconnect_loop(handler).await;
        });
        *self.listener.lock().await = Some(handle);

        // Give the stream a brief moment to establish before handshaking;
        // the reconnect loop itself drives `alive`/`state` from here on.
        let deadline = tokio::time::Instant::now() + handshake_timeout;
        while !self.alive.load(Ordering::SeqCst) {
            if tokio::time::Instant::now() >= deadline {
                return Err(HostError::Timeout(handshake_timeout));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let params = serde_json::json!({
            "protocolVersion": crate::protocol::MCP_PROTOCOL_VERSION,
            "capabilities": McpCapabilities::client_default(sampling_enabled),
            "clientInfo": { "name": "mcp-host", "version": env!("CARGO_PKG_VERSION") },
        });
        let result = tokio::time::timeout(handshake_timeout, self.call("initialize", Some(params)))
            .await
            .map_err(|_| HostError::Timeout(handshake_timeout))??;
        *self.server_info.write() = Some(result);

        self.notify("notifications/initialized", None).await?;
        self.refresh_tools().await;
        self.refresh_resources().await;
        self.refresh_prompts().await;

        Ok(())
    }

    async fn run_reconnect_loop(self: Arc<Self>, handler: Arc<dyn ServerRequestHandler>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *self.state.read() == ConnectionState::Closed {
                return;
            }
            *self.state.write() = ConnectionState::Connecting;
            match self.stream_once(&handler).await {
                Ok(()) => {
                    // Stream ended cleanly (server closed it); reconnect
                    // unless we've been explicitly stopped in the meantime.
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    warn!(server_key = %self.server_key, error = %e, "SSE stream error, will reconnect");
                }
            }

            self.alive.store(false, Ordering::SeqCst);
            if *self.state.read() == ConnectionState::Closed {
                return;
            }
            *self.state.write() = ConnectionState::Reconnecting;
            let delay = self.retry_hint.read().unwrap_or(backoff);
            tokio::time::sleep(delay).await;
            backoff = (backoff + INITIAL_BACKOFF).min(MAX_BACKOFF);
        }
    }

    async fn stream_once(&self, handler: &Arc<dyn ServerRequestHandler>) -> HostResult<()> {
        let request = self.apply_auth(self.client.get(&self.sse_url));
        let response = request
            .send()
            .await
            .map_err(|e| HostError::transport(format!("SSE connect failed: {e}")))?;
        if !response.status().is_success() {
            return Err(HostError::transport(format!(
                "SSE connect returned status {}",
                response.status()
            )));
        }

        *self.state.write() = ConnectionState::Connected;
        self.alive.store(true, Ordering::SeqCst);
        info!(server_key = %self.server_key, "SSE stream connected");

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut event_data = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| HostError::transport(format!("SSE stream error: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);

                if line.is_empty() {
                    if !event_data.is_empty() {
                        let data = std::mem::take(&mut event_data);
                        self.handle_event_data(&data, handler).await;
                    }
                    continue;
                }
                if let Some(rest) = line.strip_prefix(':') {
                    debug!(server_key = %self.server_key, comment = rest, "SSE comment");
                    continue;
                }
                if let Some(rest) = line.strip_prefix("data:") {
                    let rest = rest.strip_prefix(' ').unwrap_or(rest);
                    if !event_data.is_empty() {
                        event_data.push('\n');
                    }
                    event_data.push_str(rest);
                    continue;
                }
                if let Some(rest) = line.strip_prefix("retry:") {
                    if let Some(millis) = parse_retry_millis(rest) {
                        *self.retry_hint.write() = Some(Duration::from_millis(millis));
                    }
                    continue;
                }
                // `event:`/`id:` fields are accepted but the payload always
                // carries its own JSON-RPC `id`, so they are not tracked
                // separately here.
            }
        }

        Ok(())
    }

    async fn handle_event_data(&self, data: &str, handler: &Arc<dyn ServerRequestHandler>) {
        let value: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                warn!(server_key = %self.server_key, error = %e, "malformed SSE JSON-RPC payload");
                return;
            }
        };

        let has_id = value.get("id").is_some();
        let has_method = value.get("method").is_some();

        if has_id && !has_method {
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
            if let Err(e) = self.post_message(&response).await {
                warn!(server_key = %self.server_key, error = %e, "failed to post server-request reply");
            }
            return;
        }

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

    async fn post_message<T: serde::Serialize>(&self, body: &T) -> HostResult<()> {
        let request = self.apply_auth(self.client.post(&self.message_url).json(body));
        let response = request
            .send()
            .await
            .map_err(|e| HostError::transport(format!("POST to message endpoint failed: {e}")))?;
        if !response.status().is_success() {
            return Err(HostError::transport(format!(
                "message endpoint returned status {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Send a JSON-RPC request over the POST channel and await the
    /// correlated response that arrives later on the SSE stream.
    pub async fn call(&self, method: &str, params: Option<Value>) -> HostResult<Value> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(HostError::transport(format!(
                "session '{}' is not connected",
                self.server_key
            )));
        }
        let id = self.ids.next();
        let request = JsonRpcRequest::new(id, method, params);
        let guard = self.pending.register(id);
        self.post_message(&request).await?;

        match guard.wait().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(HostError::Upstream(format!("{}: {}", err.code, err.message))),
            Err(_) => Err(HostError::transport("stream closed before response arrived")),
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> HostResult<()> {
        let notification = JsonRpcRequest::notification(method, params);
        self.post_message(&notification).await
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
            transport: TransportKind::Sse,
            alive: self.is_alive(),
            tool_count: catalogue.tools.len(),
            resource_count: catalogue.resources.len(),
            prompt_count: catalogue.prompts.len(),
        }
    }

    pub async fn stop(&self) {
        *self.state.write() = ConnectionState::Closed;
        self.alive.store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        self.pending.fail_all(JsonRpcError::internal("session stopped"));
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Parses an SSE `retry:` field's value (milliseconds per the
/// `text/event-stream` grammar), ignoring a malformed value rather than
/// failing the stream.
fn parse_retry_millis(field_value: &str) -> Option<u64> {
    field_value.trim().parse::<u64>().ok()
}

/// Owns every SSE session, keyed by server_key, and the single
/// `reqwest::Client` shared across all of them and the LLM backends
/// (spec.md §5), so individual sessions never construct their own.
pub struct SseSessionManager {
    sessions: RwLock<HashMap<String, Arc<SseSession>>>,
    client: Client,
}

impl SseSessionManager {
    pub fn new(client: Client) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            client,
        }
    }

    pub async fn start_server(
        &self,
        mut config: SseSessionConfig,
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
        config.client = self.client.clone();
        let server_key = config.server_key.clone();
        let session = SseSession::new(&config);
        session.connect(handshake_timeout, sampling_enabled, handler).await?;
        self.sessions.write().insert(server_key, session);
        Ok(())
    }

    pub async fn stop_server(&self, server_key: &str) -> HostResult<()> {
        let session = self
            .sessions
            .write()
            .remove(server_key)
            .ok_or_else(|| HostError::not_found(format!("SSE server '{server_key}'")))?;
        session.stop().await;
        Ok(())
    }

    pub fn get(&self, server_key: &str) -> Option<Arc<SseSession>> {
        self.sessions.read().get(server_key).cloned()
    }

    pub fn live_sessions(&self) -> Vec<Arc<SseSession>> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    struct NoopHandler;

    #[async_trait]
    impl ServerRequestHandler for NoopHandler {
        async fn handle_roots_list(&self, _server_key: &str) -> Value {
            serde_json::json!({ "roots": [] })
        }

        async fn handle_sampling_create_message(
            &self,
            _server_key: &str,
            _params: Value,
        ) -> Result<Value, JsonRpcError> {
            Err(JsonRpcError::internal("not implemented in test"))
        }
    }

    /// Sentinel pushed down a connection's event channel telling its writer
    /// task to close the socket instead of writing another `data:` frame,
    /// simulating the stream dropping mid-request.
    const CLOSE_SENTINEL: &str = "\u{0}CLOSE";

    #[derive(Default)]
    struct ScenarioState {
        current_tx: StdMutex<Option<mpsc::UnboundedSender<String>>>,
        connections: AtomicUsize,
        deferred: StdMutex<Vec<String>>,
    }

    async fn read_http_message(stream: &mut TcpStream) -> (String, Vec<u8>) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 2048];
        let header_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let content_length: usize = headers
            .lines()
            .find_map(|l| l.to_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = buf[header_end..].to_vec();
        while body.len() < content_length {
            let n = stream.read(&mut chunk).await.unwrap();
            body.extend_from_slice(&chunk[..n]);
        }
        (headers, body)
    }

    /// A GET /sse connection: writes SSE headers, then relays whatever
    /// strings arrive on `rx` as `data:` frames until it sees the close
    /// sentinel or the channel closes.
    async fn run_sse_connection(mut stream: TcpStream, mut rx: mpsc::UnboundedReceiver<String>) {
        let _ = stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: keep-alive\r\n\r\n")
            .await;
        while let Some(payload) = rx.recv().await {
            if payload == CLOSE_SENTINEL {
                break;
            }
            if stream.write_all(payload.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = stream.shutdown().await;
    }

    fn jsonrpc_result(id: i64, result: Value) -> String {
        let payload = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});
        format!("data: {payload}\n\n")
    }

    /// Simulates a server that drops its SSE stream the instant a
    /// `tools/call` request arrives, then delivers that call's response
    /// only once a second SSE connection is established (spec.md §8
    /// scenario 6: a reconnect must not lose a pending request).
    async fn spawn_reconnect_scenario_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ScenarioState::default());

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                let (headers, body) = read_http_message(&mut stream).await;
                let request_line = headers.lines().next().unwrap_or_default().to_string();

                if request_line.starts_with("GET") {
                    let count = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
                    let (tx, rx) = mpsc::unbounded_channel();
                    *state.current_tx.lock().unwrap() = Some(tx);
                    if count >= 2 {
                        let deferred: Vec<String> = state.deferred.lock().unwrap().drain(..).collect();
                        if let Some(tx) = state.current_tx.lock().unwrap().as_ref() {
                            for payload in deferred {
                                let _ = tx.send(payload);
                            }
                        }
                    }
                    tokio::spawn(run_sse_connection(stream, rx));
                    continue;
                }

                // POST /message
                let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                    .await;
                let _ = stream.shutdown().await;

                let Some(method) = request.get("method").and_then(|m| m.as_str()) else { continue };
                let id = request.get("id").and_then(|v| v.as_i64());

                match method {
                    "initialize" => {
                        let result = serde_json::json!({
                            "protocolVersion": crate::protocol::MCP_PROTOCOL_VERSION,
                            "capabilities": {},
                            "serverInfo": {"name": "scenario-fixture", "version": "0.1.0"},
                        });
                        if let (Some(id), Some(tx)) = (id, state.current_tx.lock().unwrap().clone()) {
                            let _ = tx.send(jsonrpc_result(id, result));
                        }
                    }
                    "tools/list" => {
                        if let (Some(id), Some(tx)) = (id, state.current_tx.lock().unwrap().clone()) {
                            let _ = tx.send(jsonrpc_result(id, serde_json::json!({"tools": []})));
                        }
                    }
                    "resources/list" => {
                        if let (Some(id), Some(tx)) = (id, state.current_tx.lock().unwrap().clone()) {
                            let _ = tx.send(jsonrpc_result(id, serde_json::json!({"resources": []})));
                        }
                    }
                    "prompts/list" => {
                        if let (Some(id), Some(tx)) = (id, state.current_tx.lock().unwrap().clone()) {
                            let _ = tx.send(jsonrpc_result(id, serde_json::json!({"prompts": []})));
                        }
                    }
                    "tools/call" => {
                        let Some(id) = id else { continue };
                        let response = jsonrpc_result(
                            id,
                            serde_json::json!({"content": [{"type": "text", "text": "echo: hi"}], "isError": false}),
                        );
                        if state.connections.load(Ordering::SeqCst) < 2 {
                            state.deferred.lock().unwrap().push(response);
                            if let Some(tx) = state.current_tx.lock().unwrap().clone() {
                                let _ = tx.send(CLOSE_SENTINEL.to_string());
                            }
                        } else if let Some(tx) = state.current_tx.lock().unwrap().clone() {
                            let _ = tx.send(response);
                        }
                    }
                    _ => {}
                }
            }
        });

        format!("http://{addr}")
    }

    #[tokio::test]
    async fn reconnect_preserves_pending_request_across_drop() {
        let base_url = spawn_reconnect_scenario_server().await;
        let config = SseSessionConfig {
            server_key: "demo".to_string(),
            base_url,
            sse_endpoint: "/sse".to_string(),
            message_endpoint: "/message".to_string(),
            auth: SseAuth::None,
            client: Client::new(),
        };
        let session = SseSession::new(&config);
        session
            .connect(Duration::from_secs(5), false, Arc::new(NoopHandler))
            .await
            .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            session.call("tools/call", Some(serde_json::json!({"name": "echo", "arguments": {"message": "hi"}}))),
        )
        .await
        .expect("call should resolve once the reconnect delivers the deferred response");

        let value = result.expect("tools/call should succeed after the stream reconnects");
        assert_eq!(value["content"][0]["text"], "echo: hi");

        session.stop().await;
    }

    #[test]
    fn parse_retry_millis_accepts_plain_integer() {
        assert_eq!(parse_retry_millis("5000"), Some(5000));
        assert_eq!(parse_retry_millis(" 250"), Some(250));
    }

    #[test]
    fn parse_retry_millis_rejects_garbage() {
        assert_eq!(parse_retry_millis("soon"), None);
        assert_eq!(parse_retry_millis(""), None);
    }

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(join_url("http://localhost:8000/", "/sse"), "http://localhost:8000/sse");
        assert_eq!(join_url("http://localhost:8000", "sse"), "http://localhost:8000/sse");
    }

    #[tokio::test]
    async fn call_before_connect_fails_fast() {
        let config = SseSessionConfig {
            server_key: "s1".to_string(),
            base_url: "http://127.0.0.1:1".to_string(),
            sse_endpoint: "/sse".to_string(),
            message_endpoint: "/message".to_string(),
            auth: SseAuth::None,
            client: Client::new(),
        };
        let session = SseSession::new(&config);
        assert!(!session.is_alive());
        let result = session.call("tools/list", None).await;
        assert!(result.is_err());
    }

    #[test]
    fn status_reports_transport_kind() {
        let config = SseSessionConfig {
            server_key: "s1".to_string(),
            base_url: "http://localhost".to_string(),
            sse_endpoint: "/sse".to_string(),
            message_endpoint: "/message".to_string(),
            auth: SseAuth::None,
            client: Client::new(),
        };
        let session = SseSession::new(&config);
        assert_eq!(session.status().transport, TransportKind::Sse);
        assert!(!session.status().alive);
    }
}

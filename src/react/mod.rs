// src/react/mod.rs
// ReAct engine (spec.md §4.I): the user-visible reason/act/observe loop.
// Each call to `run`/`continue_after_confirmation` returns an async stream
// of `ReActEvent`s built with `async-stream`, the same way
// `backend/src/api/ws/chat/stream.rs` turns a multi-step generation into a
// channel of typed events rather than one big future.
//
// The control flow itself — synthesize system prompt, loop up to
// `max_iterations`, process tool calls sequentially, suspend on
// confirmation-required and resume with the same iteration count — is
// grounded on `examples/original_source/backend/app/services/react_engine.py`.

pub mod events;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_stream::stream;
use futures::Stream;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::error::{HostError, HostResult};
use crate::hitl::PendingToolCall;
use crate::host::Host;
use crate::llm::{Message, ToolCallInfo};

pub use events::{ReActEvent, ReActState, ToolCallPhase};

/// Tool calls an LLM turn emitted, still waiting to be prepared/executed in
/// order. Draining this queue one call at a time is what lets the engine
/// suspend mid-batch and resume exactly where it left off.
type ToolQueue = VecDeque<ToolCallInfo>;

/// Everything that must survive a suspend-for-confirmation across the
/// `run`/`continue_after_confirmation` boundary: which iteration the loop
/// was on, which LLM provider is driving it, and the remaining tool calls
/// from the turn that triggered the suspension.
struct ReActContext {
    provider: String,
    iteration: usize,
    queue: ToolQueue,
    /// Set while a `ConfirmationRequired` event is outstanding; holds the
    /// HITL gate's own request id (distinct from `ToolCallRequest::id`) and
    /// the originating tool call, so `continue_after_confirmation` knows
    /// which request it is answering.
    suspended_on: Option<String>,
}

/// Owns one `ReActContext` per session and drives its loop against a shared
/// `Host`. Stateless beyond that map — all subsystem state (roots, HITL,
/// sampling, transports) lives in `Host`.
pub struct ReActEngine {
    host: Arc<Host>,
    contexts: Mutex<HashMap<String, ReActContext>>,
}

impl ReActEngine {
    pub fn new(host: Arc<Host>) -> Self {
        Self {
            host,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    fn max_iterations(&self) -> usize {
        self.host.config.host.max_iterations
    }

    /// System prompt synthesized the first time a session is seen: a fixed
    /// preamble plus the live fused-tool catalogue, so the model never needs
    /// a separate tool-listing round trip.
    fn system_prompt(&self) -> String {
        format!(
            "You are an assistant with access to external tools through a Model \
             Context Protocol host. Call a tool by name when it helps answer the \
             user; tools marked high-risk in the catalogue below will pause for a \
             human to approve before they run.\n\n{}",
            self.host.aggregator().render_catalogue()
        )
    }

    /// Run one user turn to completion (or suspension). `provider` selects
    /// which configured `LlmBackend` drives this session's reasoning.
    pub fn run(
        self: &Arc<Self>,
        session_id: String,
        user_input: String,
        provider: String,
    ) -> impl Stream<Item = ReActEvent> + Send + 'static {
        let engine = self.clone();
        stream! {
            if engine.host.with_session(&session_id, |_| ()).is_err() {
                let system_prompt = engine.system_prompt();
                engine.host.create_session(Some(session_id.clone()), Some(system_prompt));
            }

            let append_result = engine.host.with_session(&session_id, |session| {
                session.conversation.push(Message::user(user_input.clone()));
            });
            if let Err(e) = append_result {
                yield ReActEvent::Error { error: e.to_string() };
                return;
            }

            engine.contexts.lock().insert(
                session_id.clone(),
                ReActContext { provider, iteration: 0, queue: VecDeque::new(), suspended_on: None },
            );

            yield ReActEvent::State { state: ReActState::Reasoning, message: None };

            for await event in engine.drive(session_id) {
                yield event;
            }
        }
    }

    /// Resume a suspended session after a human verdict on `request_id`.
    /// `approved=false` records a rejection observation and continues the
    /// loop; `approved=true` executes the (possibly modified) call.
    pub fn continue_after_confirmation(
        self: &Arc<Self>,
        session_id: String,
        request_id: String,
        approver: String,
        approved: bool,
        modified_args: Option<serde_json::Value>,
        reason: Option<String>,
    ) -> impl Stream<Item = ReActEvent> + Send + 'static {
        let engine = self.clone();
        stream! {
            let matches_suspended = engine
                .contexts
                .lock()
                .get(&session_id)
                .and_then(|ctx| ctx.suspended_on.clone())
                .map(|id| id == request_id)
                .unwrap_or(false);
            if !matches_suspended {
                yield ReActEvent::Error {
                    error: format!("session '{session_id}' has no suspended confirmation '{request_id}'"),
                };
                return;
            }

            let outcome = engine
                .host
                .confirm_tool_call(&request_id, &approver, approved, modified_args, reason.as_deref())
                .await;

            if let Some(ctx) = engine.contexts.lock().get_mut(&session_id) {
                ctx.suspended_on = None;
            }

            match outcome {
                Ok(result) => {
                    if result.was_rejected {
                        yield ReActEvent::ToolRejected {
                            request_id: request_id.clone(),
                            message: result.error.clone().unwrap_or_else(|| "rejected".to_string()),
                        };
                        let observation = result.error.unwrap_or_else(|| "user rejected the tool call".to_string());
                        let _ = engine.host.with_session(&session_id, |session| {
                            session.conversation.push(Message::tool_result(request_id.clone(), observation));
                        });
                    } else {
                        yield ReActEvent::ToolResult {
                            tool: None,
                            success: result.success,
                            result: result.result.clone(),
                            error: result.error.clone(),
                            execution_time_ms: result.elapsed_ms,
                        };
                        let observation = render_observation(&result);
                        let _ = engine.host.with_session(&session_id, |session| {
                            session.conversation.push(Message::tool_result(request_id.clone(), observation));
                        });
                    }
                }
                Err(e) => {
                    yield ReActEvent::Error { error: e.to_string() };
                    return;
                }
            }

            for await event in engine.drive(session_id) {
                yield event;
            }
        }
    }

    /// The iteration loop shared by `run` and `continue_after_confirmation`
    /// once the triggering message has already been appended. Drains any
    /// queued tool calls left over from a suspended batch first, then calls
    /// the LLM for as many further iterations as remain.
    fn drive(self: &Arc<Self>, session_id: String) -> impl Stream<Item = ReActEvent> + Send + 'static {
        let engine = self.clone();
        stream! {
            loop {
                let queued = engine.contexts.lock().get_mut(&session_id).map(|ctx| ctx.queue.pop_front());
                let Some(maybe_call) = queued else {
                    yield ReActEvent::Error { error: format!("session '{session_id}' has no ReAct context") };
                    return;
                };

                if let Some(call) = maybe_call {
                    match engine.process_tool_call(&session_id, call).await {
                        Ok(batch) => {
                            let suspended = batch.last().map(|e| e.suspends()).unwrap_or(false);
                            for event in batch {
                                yield event;
                            }
                            if suspended {
                                return;
                            }
                        }
                        Err(e) => {
                            yield ReActEvent::Error { error: e.to_string() };
                            return;
                        }
                    }
                    continue;
                }

                // queue drained: either start a fresh LLM turn or stop if
                // iterations are exhausted.
                let iteration = match engine.contexts.lock().get(&session_id) {
                    Some(ctx) => ctx.iteration,
                    None => {
                        yield ReActEvent::Error { error: format!("session '{session_id}' has no ReAct context") };
                        return;
                    }
                };
                if iteration >= engine.max_iterations() {
                    yield ReActEvent::Error {
                        error: format!("exceeded max_iterations ({})", engine.max_iterations()),
                    };
                    return;
                }

                match engine.call_llm(&session_id).await {
                    Ok(calls) if calls.is_empty() => {
                        let content = engine
                            .host
                            .with_session(&session_id, |session| {
                                session.conversation.last().map(|m| m.content.clone()).unwrap_or_default()
                            })
                            .unwrap_or_default();
                        let steps = engine.contexts.lock().get(&session_id).map(|c| c.iteration as u32).unwrap_or(0);
                        yield ReActEvent::Final { content, steps };
                        engine.contexts.lock().remove(&session_id);
                        return;
                    }
                    Ok(calls) => {
                        if let Some(ctx) = engine.contexts.lock().get_mut(&session_id) {
                            ctx.iteration += 1;
                            ctx.queue = calls.into();
                        }
                        yield ReActEvent::State { state: ReActState::Reasoning, message: None };
                    }
                    Err(e) => {
                        error!(session_id = %session_id, error = %e, "react engine: llm call failed");
                        yield ReActEvent::Error { error: e.to_string() };
                        engine.contexts.lock().remove(&session_id);
                        return;
                    }
                }
            }
        }
    }

    /// Snapshot the conversation and tool schema, call the session's LLM
    /// backend, append the assistant's reply (tool-call structure included)
    /// and return the parsed tool calls the model wants to make.
    async fn call_llm(&self, session_id: &str) -> HostResult<Vec<ToolCallInfo>> {
        let provider = self
            .contexts
            .lock()
            .get(session_id)
            .map(|ctx| ctx.provider.clone())
            .ok_or_else(|| HostError::not_found(format!("react context '{session_id}'")))?;

        let backend = self.host.llm_backend(&provider)?;
        let tools = self.host.aggregator().to_openai_tools();

        let (messages, system_prompt) = self.host.with_session(session_id, |session| {
            let system_prompt = session
                .conversation
                .iter()
                .find(|m| m.role == "system")
                .map(|m| m.content.clone());
            let rest: Vec<Message> = session
                .conversation
                .iter()
                .filter(|m| m.role != "system")
                .cloned()
                .collect();
            (rest, system_prompt)
        })?;

        let response = backend.complete(&messages, system_prompt.as_deref(), &tools).await?;

        self.host.with_session(session_id, |session| {
            if response.tool_calls.is_empty() {
                session.conversation.push(Message::assistant(response.content.clone()));
            } else {
                session.conversation.push(Message::assistant_with_tool_calls(
                    response.content.clone(),
                    response.tool_calls.clone(),
                ));
            }
        })?;

        Ok(response.tool_calls)
    }

    /// Prepare, and either suspend on or execute, one tool call from the
    /// current batch. Returns every event this call produced, in emission
    /// order; a batch whose last event is `ConfirmationRequired` tells
    /// `drive` to suspend rather than continue draining the queue.
    async fn process_tool_call(
        &self,
        session_id: &str,
        call: ToolCallInfo,
    ) -> HostResult<Vec<ReActEvent>> {
        let mut events = vec![ReActEvent::ToolCall {
            tool: call.name.clone(),
            arguments: Some(call.arguments.clone()),
            state: ToolCallPhase::Preparing,
        }];

        let request = self.host.prepare_tool_call(session_id, &call.name, call.arguments.clone())?;

        if request.requires_confirmation {
            let pending = PendingToolCall {
                request_id: request.id.clone(),
                session_id: request.session_id.clone(),
                server_key: request.server_key.clone(),
                tool_local_name: request.tool_local_name.clone(),
                public_tool_name: request.public_tool_name.clone(),
                arguments: request.arguments.clone(),
                risk_level: request.risk_level,
            };
            let confirmation = self.host.hitl.create(pending);

            if let Some(ctx) = self.contexts.lock().get_mut(session_id) {
                ctx.suspended_on = Some(confirmation.id.clone());
            }

            info!(session_id, request_id = %confirmation.id, tool = %request.public_tool_name, "react engine: suspended for confirmation");
            events.push(ReActEvent::ConfirmationRequired {
                request_id: confirmation.id,
                tool: request.public_tool_name.clone(),
                arguments: request.arguments.clone(),
                risk_level: request.risk_level.as_str().to_string(),
                message: format!(
                    "'{}' is classified {} and requires human approval before it runs",
                    request.public_tool_name,
                    request.risk_level.as_str()
                ),
            });
            return Ok(events);
        }

        events.push(ReActEvent::ToolCall {
            tool: request.public_tool_name.clone(),
            arguments: None,
            state: ToolCallPhase::Executing,
        });

        let result = self.host.execute_tool_call(&request, false, false).await;
        let observation = render_observation(&result);
        self.host.with_session(session_id, |session| {
            session.conversation.push(Message::tool_result(call.id.clone(), observation));
        })?;

        events.push(ReActEvent::ToolResult {
            tool: Some(request.public_tool_name),
            success: result.success,
            result: result.result,
            error: result.error,
            execution_time_ms: result.elapsed_ms,
        });

        Ok(events)
    }
}

fn render_observation(result: &crate::host::ToolCallResult) -> String {
    if let Some(error) = &result.error {
        return format!("error: {error}");
    }
    result
        .result
        .as_ref()
        .map(|v| serde_json::to_string(v).unwrap_or_else(|_| v.to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hitl::HitlGate;
    use crate::llm::{LlmBackend, LlmResponse, TokenUsage};
    use crate::roots::RootsRegistry;
    use crate::sampling::{
        SamplingContent, SamplingExecutor, SamplingRequest, SamplingResponse, SamplingService, StopReason,
    };
    use async_trait::async_trait;
    use futures::StreamExt;

    struct EchoExecutor;

    #[async_trait]
    impl SamplingExecutor for EchoExecutor {
        async fn complete(&self, _request: &SamplingRequest) -> Result<SamplingResponse, String> {
            Ok(SamplingResponse {
                role: "assistant".to_string(),
                content: SamplingContent::Text("ok".to_string()),
                model: "fake".to_string(),
                stop_reason: Some(StopReason::EndTurn),
            })
        }
    }

    /// Always answers with plain text and no tool calls, so `drive` reaches
    /// `Final` on the very first LLM turn.
    struct FakeLlmBackend;

    #[async_trait]
    impl LlmBackend for FakeLlmBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn complete(
            &self,
            _messages: &[Message],
            _system: Option<&str>,
            _tools: &[serde_json::Value],
        ) -> HostResult<LlmResponse> {
            Ok(LlmResponse {
                content: "final answer".to_string(),
                tool_calls: Vec::new(),
                usage: TokenUsage::default(),
                model: "fake".to_string(),
                finish_reason: crate::llm::FinishReason::EndTurn,
            })
        }
    }

    fn test_engine() -> Arc<ReActEngine> {
        let config = Config::for_tests();
        let roots = Arc::new(RootsRegistry::new(config.host.roots_strict_mode_default));
        let hitl = Arc::new(HitlGate::new(&config.hitl));
        let sampling = Arc::new(SamplingService::new(config.sampling.clone(), Arc::new(EchoExecutor)));
        let mut backends: HashMap<String, Arc<dyn LlmBackend>> = HashMap::new();
        backends.insert("fake".to_string(), Arc::new(FakeLlmBackend));
        let host = Host::new(config, roots, hitl, sampling, backends, reqwest::Client::new());
        Arc::new(ReActEngine::new(host))
    }

    #[test]
    fn system_prompt_mentions_no_tools_when_none_connected() {
        let engine = test_engine();
        assert!(engine.system_prompt().contains("No tools are currently available"));
    }

    #[tokio::test]
    async fn run_reaches_final_when_llm_returns_no_tool_calls() {
        let engine = test_engine();
        let events: Vec<ReActEvent> = engine
            .run("s1".to_string(), "hello".to_string(), "fake".to_string())
            .collect()
            .await;

        assert!(matches!(
            events.first(),
            Some(ReActEvent::State { state: ReActState::Reasoning, .. })
        ));
        match events.last() {
            Some(ReActEvent::Final { content, .. }) => assert_eq!(content, "final answer"),
            other => panic!("expected Final, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_with_unknown_provider_emits_error() {
        let engine = test_engine();
        let events: Vec<ReActEvent> = engine
            .run("s1".to_string(), "hello".to_string(), "missing".to_string())
            .collect()
            .await;
        assert!(matches!(events.last(), Some(ReActEvent::Error { .. })));
    }

    #[tokio::test]
    async fn continue_after_confirmation_without_suspended_context_errors() {
        let engine = test_engine();
        let events: Vec<ReActEvent> = engine
            .continue_after_confirmation(
                "no-such-session".to_string(),
                "no-such-request".to_string(),
                "user".to_string(),
                true,
                None,
                None,
            )
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ReActEvent::Error { .. }));
    }
}

// src/main.rs
// Binary entrypoint. The HTTP surface that actually serves requests is an
// external collaborator (spec.md §1); this binary only demonstrates the
// wiring a host process needs to build a `Host`, run it, and shut it down
// cleanly, the way `mira-chat/src/main.rs` assembles its own services before
// handing off to a REPL or server loop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use reqwest::Client;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use mcp_host::config::{Config, LlmProviderKind};
use mcp_host::hitl::HitlGate;
use mcp_host::llm::{anthropic::AnthropicBackend, ollama::OllamaBackend, openai::OpenAiBackend, qwen::QwenBackend, zhipu::ZhipuBackend, FinishReason, LlmBackend, Message};
use mcp_host::react::ReActEngine;
use mcp_host::roots::RootsRegistry;
use mcp_host::sampling::{SamplingContent, SamplingExecutor, SamplingRequest, SamplingResponse, SamplingService, StopReason};
use mcp_host::Host;

#[derive(Parser)]
#[command(name = "mcp-host")]
#[command(about = "Mediating runtime between an LLM and a fleet of Model Context Protocol servers")]
struct Args {
    /// Which configured LLM provider drives sampling requests with no
    /// per-server override (first configured provider if unset).
    #[arg(long, env = "MCP_HOST_DEFAULT_PROVIDER")]
    default_provider: Option<String>,
}

/// Adapts a normalized `LlmBackend` into the `SamplingExecutor` the sampling
/// pipeline calls after approval, converting the MCP sampling wire shapes
/// into the host's own `Message`/`LlmResponse` types and back.
struct LlmSamplingExecutor {
    backend: Arc<dyn LlmBackend>,
}

#[async_trait]
impl SamplingExecutor for LlmSamplingExecutor {
    async fn complete(&self, request: &SamplingRequest) -> Result<SamplingResponse, String> {
        let messages: Vec<Message> = request
            .messages
            .iter()
            .map(|m| Message {
                role: m.role.clone(),
                content: m.content.as_text(),
                tool_call_id: None,
                tool_calls: None,
            })
            .collect();

        let response = self
            .backend
            .complete(&messages, request.system_prompt.as_deref(), &[])
            .await
            .map_err(|e| e.to_string())?;

        let stop_reason = match response.finish_reason {
            FinishReason::EndTurn => StopReason::EndTurn,
            FinishReason::MaxTokens => StopReason::MaxTokens,
            FinishReason::StopSequence => StopReason::StopSequence,
            FinishReason::Error => StopReason::Error,
        };

        Ok(SamplingResponse {
            role: "assistant".to_string(),
            content: SamplingContent::Text(response.content),
            model: response.model,
            stop_reason: Some(stop_reason),
        })
    }
}

fn build_llm_backends(config: &Config, client: &Client) -> HashMap<String, Arc<dyn LlmBackend>> {
    let mut backends: HashMap<String, Arc<dyn LlmBackend>> = HashMap::new();
    for (key, provider) in &config.llm_providers {
        let backend: Arc<dyn LlmBackend> = match provider.kind {
            LlmProviderKind::OpenAi => Arc::new(OpenAiBackend::new(client.clone(), provider.clone())),
            LlmProviderKind::Anthropic => Arc::new(AnthropicBackend::new(client.clone(), provider.clone())),
            LlmProviderKind::Ollama => Arc::new(OllamaBackend::new(client.clone(), provider.clone())),
            LlmProviderKind::Zhipu => Arc::new(ZhipuBackend::new(client.clone(), provider.clone())),
            LlmProviderKind::QwenLocal => Arc::new(QwenBackend::new(client.clone(), provider.clone())),
        };
        backends.insert(key.clone(), backend);
    }
    backends
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    mcp_host::metrics::init_metrics();

    let args = Args::parse();
    let config = Config::from_env();

    let client = Client::new();
    let llm_backends = build_llm_backends(&config, &client);

    let default_provider = args
        .default_provider
        .or_else(|| config.llm_providers.keys().next().cloned());
    let sampling_executor: Arc<dyn SamplingExecutor> = match default_provider.as_deref().and_then(|p| llm_backends.get(p)) {
        Some(backend) => Arc::new(LlmSamplingExecutor { backend: backend.clone() }),
        None => {
            warn!("no LLM provider configured; sampling/createMessage requests will fail until one is added");
            Arc::new(LlmSamplingExecutor {
                backend: Arc::new(UnconfiguredBackend),
            })
        }
    };

    let roots = Arc::new(RootsRegistry::new(config.host.roots_strict_mode_default));
    let hitl = Arc::new(HitlGate::new(&config.hitl));
    let sampling = Arc::new(SamplingService::new(config.sampling.clone(), sampling_executor));

    let host = Host::new(config, roots, hitl, sampling, llm_backends, client);
    let engine = Arc::new(ReActEngine::new(host.clone()));
    let _ = engine; // held by the external HTTP surface in a real deployment

    info!("mcp-host runtime assembled; no MCP servers are configured by default (they arrive via the external Config Store)");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
        _ = wait_for_sigterm() => {
            info!("received SIGTERM, shutting down");
        }
    }

    host.cleanup_all().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending().await
}

/// Placeholder backend used only when no LLM provider is configured at all,
/// so sampling construction never panics; every call fails loudly instead.
struct UnconfiguredBackend;

#[async_trait]
impl LlmBackend for UnconfiguredBackend {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    async fn complete(
        &self,
        _messages: &[Message],
        _system: Option<&str>,
        _tools: &[serde_json::Value],
    ) -> mcp_host::HostResult<mcp_host::llm::LlmResponse> {
        Err(mcp_host::HostError::fatal(
            "no LLM provider is configured; set at least one of OPENAI_BASE_URL, ANTHROPIC_BASE_URL, OLLAMA_BASE_URL, ZHIPU_BASE_URL, QWEN_BASE_URL",
        ))
    }
}

// src/config/env.rs
// Env-driven configuration assembly. Built once in `main.rs` / test setup and
// handed to `Host::new(config)` — no global mutable config singleton.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::helpers::{env_bool, env_or, env_parsed_or, env_usize, require_env};
use crate::risk::RiskLevel;

/// Host-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub max_iterations: usize,
    pub default_tool_call_timeout_secs: u64,
    pub roots_strict_mode_default: bool,
}

impl HostConfig {
    pub fn from_env() -> Self {
        Self {
            max_iterations: env_usize("HOST_MAX_ITERATIONS", 10),
            default_tool_call_timeout_secs: env_parsed_or("HOST_TOOL_CALL_TIMEOUT_SECS", 120),
            roots_strict_mode_default: env_bool("HOST_ROOTS_STRICT_MODE_DEFAULT", true),
        }
    }
}

/// HITL policy: which risk levels require confirmation, timeouts, overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlPolicyConfig {
    pub confirmation_levels: Vec<RiskLevel>,
    pub confirmation_timeout_secs: u64,
    pub allow_modification: bool,
    pub require_double_confirmation: bool,
    pub whitelisted_tools: Vec<String>,
    pub blacklisted_tools: Vec<String>,
}

impl HitlPolicyConfig {
    pub fn from_env() -> Self {
        Self {
            confirmation_levels: vec![RiskLevel::High, RiskLevel::Critical],
            confirmation_timeout_secs: env_parsed_or("HITL_CONFIRMATION_TIMEOUT_SECS", 300),
            allow_modification: env_bool("HITL_ALLOW_MODIFICATION", true),
            require_double_confirmation: env_bool("HITL_REQUIRE_DOUBLE_CONFIRMATION", true),
            whitelisted_tools: split_csv_env("HITL_WHITELISTED_TOOLS"),
            blacklisted_tools: split_csv_env("HITL_BLACKLISTED_TOOLS"),
        }
    }
}

/// Sampling security policy; field set matches spec.md §3 verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingSecurityConfig {
    pub max_tokens_limit: u32,
    pub default_max_tokens: u32,
    pub rate_limit_per_minute: u32,
    pub rate_limit_per_server_per_minute: u32,
    pub enable_content_filter: bool,
    pub blocked_keywords: Vec<String>,
    pub require_approval: bool,
    pub auto_approve_token_threshold: u32,
    pub approval_timeout_secs: u64,
    pub server_allowlist: Vec<String>,
    pub server_denylist: Vec<String>,
}

impl SamplingSecurityConfig {
    pub fn from_env() -> Self {
        Self {
            max_tokens_limit: env_parsed_or("SAMPLING_MAX_TOKENS_LIMIT", 4096),
            default_max_tokens: env_parsed_or("SAMPLING_DEFAULT_MAX_TOKENS", 1024),
            rate_limit_per_minute: env_parsed_or("SAMPLING_RATE_LIMIT_PER_MINUTE", 60),
            rate_limit_per_server_per_minute: env_parsed_or(
                "SAMPLING_RATE_LIMIT_PER_SERVER_PER_MINUTE",
                10,
            ),
            enable_content_filter: env_bool("SAMPLING_ENABLE_CONTENT_FILTER", true),
            blocked_keywords: split_csv_env("SAMPLING_BLOCKED_KEYWORDS"),
            require_approval: env_bool("SAMPLING_REQUIRE_APPROVAL", false),
            auto_approve_token_threshold: env_parsed_or("SAMPLING_AUTO_APPROVE_THRESHOLD", 100),
            approval_timeout_secs: env_parsed_or("SAMPLING_APPROVAL_TIMEOUT_SECS", 300),
            server_allowlist: split_csv_env("SAMPLING_SERVER_ALLOWLIST"),
            server_denylist: split_csv_env("SAMPLING_SERVER_DENYLIST"),
        }
    }
}

/// Which vendor dialect an `LlmProviderConfig` speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProviderKind {
    OpenAi,
    Anthropic,
    Ollama,
    Zhipu,
    QwenLocal,
}

/// Per-provider configuration. The API key is never rendered by `Debug`.
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    pub kind: LlmProviderKind,
    pub base_url: String,
    pub api_key: String,
    pub default_model: String,
}

impl std::fmt::Debug for LlmProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmProviderConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("api_key", &"***redacted***")
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl LlmProviderConfig {
    fn from_env_prefixed(prefix: &str, kind: LlmProviderKind, default_model: &str) -> Option<Self> {
        let base_url = std::env::var(format!("{prefix}_BASE_URL")).ok()?;
        let api_key = env_or(&format!("{prefix}_API_KEY"), "");
        let default_model = env_or(&format!("{prefix}_DEFAULT_MODEL"), default_model);
        Some(Self {
            kind,
            base_url,
            api_key,
            default_model,
        })
    }
}

/// Auth scheme for an SSE MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum SseAuth {
    None,
    Bearer { token: String },
    ApiKey { header: String, value: String },
    Custom { header: String, value: String },
}

/// Transport-specific configuration for one MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum McpTransportConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        handshake_timeout_secs: u64,
    },
    Sse {
        base_url: String,
        sse_endpoint: String,
        message_endpoint: String,
        auth: SseAuth,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub server_key: String,
    pub transport: McpTransportConfig,
}

/// Top-level configuration, assembled once at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: HostConfig,
    pub hitl: HitlPolicyConfig,
    pub sampling: SamplingSecurityConfig,
    pub llm_providers: HashMap<String, LlmProviderConfig>,
    pub mcp_servers: Vec<McpServerConfig>,
}

impl Config {
    /// Assemble configuration from the environment. `.env` is loaded first
    /// if present (matching the teacher's `dotenv::dotenv().ok()` startup
    /// idiom); absence of a `.env` file is not an error.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let mut llm_providers = HashMap::new();
        if let Some(c) = LlmProviderConfig::from_env_prefixed("OPENAI", LlmProviderKind::OpenAi, "gpt-4o")
        {
            llm_providers.insert("openai".to_string(), c);
        }
        if let Some(c) =
            LlmProviderConfig::from_env_prefixed("ANTHROPIC", LlmProviderKind::Anthropic, "claude-3-5-sonnet-latest")
        {
            llm_providers.insert("anthropic".to_string(), c);
        }
        if let Some(c) = LlmProviderConfig::from_env_prefixed("OLLAMA", LlmProviderKind::Ollama, "llama3")
        {
            llm_providers.insert("ollama".to_string(), c);
        }
        if let Some(c) = LlmProviderConfig::from_env_prefixed("ZHIPU", LlmProviderKind::Zhipu, "glm-4")
        {
            llm_providers.insert("zhipu".to_string(), c);
        }
        if let Some(c) =
            LlmProviderConfig::from_env_prefixed("QWEN", LlmProviderKind::QwenLocal, "qwen2.5")
        {
            llm_providers.insert("qwen".to_string(), c);
        }

        Self {
            host: HostConfig::from_env(),
            hitl: HitlPolicyConfig::from_env(),
            sampling: SamplingSecurityConfig::from_env(),
            llm_providers,
            // MCP server registry is, per spec.md §1, owned by the external
            // Config Store; this crate accepts whatever it hands over at
            // `Host::new` time rather than reading it from the environment.
            mcp_servers: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            host: HostConfig {
                max_iterations: 10,
                default_tool_call_timeout_secs: 120,
                roots_strict_mode_default: true,
            },
            hitl: HitlPolicyConfig {
                confirmation_levels: vec![RiskLevel::High, RiskLevel::Critical],
                confirmation_timeout_secs: 300,
                allow_modification: true,
                require_double_confirmation: true,
                whitelisted_tools: Vec::new(),
                blacklisted_tools: Vec::new(),
            },
            sampling: SamplingSecurityConfig {
                max_tokens_limit: 4096,
                default_max_tokens: 1024,
                rate_limit_per_minute: 60,
                rate_limit_per_server_per_minute: 10,
                enable_content_filter: true,
                blocked_keywords: Vec::new(),
                require_approval: false,
                auto_approve_token_threshold: 100,
                approval_timeout_secs: 300,
                server_allowlist: Vec::new(),
                server_denylist: Vec::new(),
            },
            llm_providers: HashMap::new(),
            mcp_servers: Vec::new(),
        }
    }
}

/// `require_env`-backed required value; exists to match the teacher's
/// "fail fast at startup" convention used for genuinely required settings.
#[allow(dead_code)]
fn require(key: &str) -> String {
    require_env(key)
}

fn split_csv_env(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hitl_default_levels_are_high_and_critical() {
        std::env::remove_var("HITL_CONFIRMATION_TIMEOUT_SECS");
        let cfg = HitlPolicyConfig::from_env();
        assert_eq!(cfg.confirmation_levels, vec![RiskLevel::High, RiskLevel::Critical]);
        assert_eq!(cfg.confirmation_timeout_secs, 300);
    }

    #[test]
    fn sampling_defaults_match_spec() {
        for k in [
            "SAMPLING_MAX_TOKENS_LIMIT",
            "SAMPLING_DEFAULT_MAX_TOKENS",
            "SAMPLING_RATE_LIMIT_PER_MINUTE",
            "SAMPLING_RATE_LIMIT_PER_SERVER_PER_MINUTE",
            "SAMPLING_REQUIRE_APPROVAL",
            "SAMPLING_AUTO_APPROVE_THRESHOLD",
        ] {
            std::env::remove_var(k);
        }
        let cfg = SamplingSecurityConfig::from_env();
        assert_eq!(cfg.max_tokens_limit, 4096);
        assert_eq!(cfg.default_max_tokens, 1024);
        assert_eq!(cfg.rate_limit_per_minute, 60);
        assert_eq!(cfg.rate_limit_per_server_per_minute, 10);
        assert!(!cfg.require_approval);
        assert_eq!(cfg.auto_approve_token_threshold, 100);
    }

    #[test]
    fn provider_config_debug_redacts_api_key() {
        let cfg = LlmProviderConfig {
            kind: LlmProviderKind::OpenAi,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: "sk-super-secret".to_string(),
            default_model: "gpt-4o".to_string(),
        };
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("sk-super-secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn split_csv_env_trims_and_filters_empty() {
        std::env::set_var("TEST_CSV_HELPER", "a, b ,, c");
        assert_eq!(split_csv_env("TEST_CSV_HELPER"), vec!["a", "b", "c"]);
        std::env::remove_var("TEST_CSV_HELPER");
    }
}

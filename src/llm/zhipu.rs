// src/llm/zhipu.rs
// Zhipu (open.bigmodel.cn) dialect: OpenAI-compatible wire format wrapped in
// a combined rate gate and 429-aware retry loop. Grounded on
// `examples/original_source/backend/app/services/react_engine.py::_call_zhipu`
// and `_await_zhipu_rate_limit`.
//
// The original throttles with three overlapping primitives: a semaphore of
// 1 (no concurrent Zhipu calls), a 6-second minimum spacing between calls,
// and an 8-calls-per-60-second sliding window. `governor` is the right crate
// for the spacing half of that (a classic token-bucket problem); the sliding
// window is tracked by hand in `next_wait` below for the same reason
// `sampling/rate_limit.rs` hand-rolls its windows rather than reach for a
// token bucket.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tracing::warn;

use super::{
    messages_to_openai_json, parse_openai_tool_calls, parse_openai_usage, FinishReason, LlmBackend,
    LlmResponse, Message, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
};
use crate::config::LlmProviderConfig;
use crate::error::{HostError, HostResult};

const MIN_INTERVAL: Duration = Duration::from_secs(6);
const WINDOW: Duration = Duration::from_secs(60);
const MAX_PER_MINUTE: usize = 8;
const MAX_RETRIES: u32 = 3;
const BASE_RETRY_DELAY_SECS: u64 = 5;

struct RateGate {
    semaphore: Semaphore,
    state: Mutex<RateGateState>,
}

struct RateGateState {
    next_ts: Instant,
    request_times: VecDeque<Instant>,
}

impl RateGate {
    fn new() -> Self {
        Self {
            semaphore: Semaphore::new(1),
            state: Mutex::new(RateGateState {
                next_ts: Instant::now(),
                request_times: VecDeque::new(),
            }),
        }
    }

    /// Blocks until both the minimum-interval and sliding-window gates
    /// admit one more call, then records it as taken.
    async fn wait_turn(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                while let Some(&front) = state.request_times.front() {
                    if now.duration_since(front) >= WINDOW {
                        state.request_times.pop_front();
                    } else {
                        break;
                    }
                }
                let mut wait_until = state.next_ts;
                if state.request_times.len() >= MAX_PER_MINUTE {
                    if let Some(&oldest) = state.request_times.front() {
                        wait_until = wait_until.max(oldest + WINDOW);
                    }
                }
                if wait_until <= now {
                    state.next_ts = now + MIN_INTERVAL;
                    state.request_times.push_back(now);
                    None
                } else {
                    Some(wait_until - now)
                }
            };

            match wait {
                None => return,
                Some(duration) => {
                    warn!(wait_secs = duration.as_secs_f64(), "zhipu rate gate: pacing request");
                    tokio::time::sleep(duration).await;
                }
            }
        }
    }
}

pub struct ZhipuBackend {
    client: Client,
    config: LlmProviderConfig,
    gate: RateGate,
}

impl ZhipuBackend {
    pub fn new(client: Client, config: LlmProviderConfig) -> Self {
        Self {
            client,
            config,
            gate: RateGate::new(),
        }
    }

    async fn send_once(&self, payload: &Value) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(payload)
            .send()
            .await
    }
}

#[async_trait]
impl LlmBackend for ZhipuBackend {
    fn name(&self) -> &'static str {
        "zhipu"
    }

    async fn complete(
        &self,
        messages: &[Message],
        system: Option<&str>,
        tools: &[Value],
    ) -> HostResult<LlmResponse> {
        let mut payload = serde_json::json!({
            "model": self.config.default_model,
            "messages": messages_to_openai_json(messages, system),
            "temperature": DEFAULT_TEMPERATURE,
            "max_tokens": DEFAULT_MAX_TOKENS,
        });
        if !tools.is_empty() {
            payload["tools"] = Value::Array(tools.to_vec());
            payload["tool_choice"] = Value::String("auto".to_string());
        }

        let mut last_error = None;
        for attempt in 0..=MAX_RETRIES {
            self.gate.wait_turn().await;
            let _permit = self.gate.semaphore.acquire().await.expect("semaphore never closed");

            let response = self.send_once(&payload).await?;
            let status = response.status();

            if status.as_u16() == 429 {
                last_error = Some(format!("zhipu API rate limited (429) on attempt {}", attempt + 1));
                if attempt < MAX_RETRIES {
                    let retry_after = response
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok());
                    let delay = retry_after
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| Duration::from_secs(BASE_RETRY_DELAY_SECS * 2u64.pow(attempt)));
                    warn!(attempt = attempt + 1, delay_secs = delay.as_secs(), "zhipu 429, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(HostError::upstream(
                    "zhipu API rate limited (429) after exhausting retries; wait 30-60s or reduce request frequency",
                ));
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(HostError::upstream(format!("zhipu API returned {status}: {body}")));
            }

            let result: Value = response.json().await?;
            let choice = result
                .get("choices")
                .and_then(|c| c.get(0))
                .ok_or_else(|| HostError::upstream("zhipu response missing choices[0]"))?;
            let message = choice.get("message").cloned().unwrap_or_default();
            let content = message.get("content").and_then(|c| c.as_str()).unwrap_or_default().to_string();
            let tool_calls = message
                .get("tool_calls")
                .and_then(|v| v.as_array())
                .map(|raw| parse_openai_tool_calls(raw))
                .unwrap_or_default();
            let usage = parse_openai_usage(result.get("usage"));
            let finish_reason = FinishReason::from_openai(choice.get("finish_reason").and_then(|v| v.as_str()));

            return Ok(LlmResponse {
                content,
                tool_calls,
                usage,
                model: self.config.default_model.clone(),
                finish_reason,
            });
        }

        Err(HostError::upstream(last_error.unwrap_or_else(|| "zhipu API call failed".to_string())))
    }
}

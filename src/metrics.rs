// src/metrics.rs
// Ambient observability (SPEC_FULL.md §10.5): Prometheus counters/histograms
// for tool calls, HITL decisions, sampling calls and LLM calls, in the shape
// of `backend/src/metrics/mod.rs`'s `OnceLock<PrometheusHandle>` +
// macro-based recording + `RequestTimer` Drop pattern. This crate does not
// bind a port; `metrics_snapshot()` hands the rendered text to whatever
// (out-of-scope) HTTP surface mounts `/metrics`.

use std::sync::OnceLock;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Call once, from `main.rs` /
/// test harnesses only — library code never initializes this itself.
pub fn init_metrics() {
    if PROMETHEUS_HANDLE.get().is_some() {
        return;
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    let _ = PROMETHEUS_HANDLE.set(handle);
    info!("Prometheus metrics initialized");
}

/// Rendered Prometheus exposition text, or `None` if `init_metrics` was
/// never called (e.g. a unit test that doesn't care about metrics).
pub fn metrics_snapshot() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

pub fn record_tool_call(risk_level: &str, outcome: &str) {
    counter!("mcp_host_tool_calls_total", "risk_level" => risk_level.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

pub fn record_tool_call_duration(risk_level: &str, duration_seconds: f64) {
    histogram!("mcp_host_tool_call_duration_seconds", "risk_level" => risk_level.to_string())
        .record(duration_seconds);
}

pub fn record_hitl_decision(status: &str) {
    counter!("mcp_host_hitl_decisions_total", "status" => status.to_string()).increment(1);
}

pub fn record_sampling_call(server_key: &str, outcome: &str) {
    counter!("mcp_host_sampling_calls_total", "server" => server_key.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

pub fn record_llm_call(provider: &str, outcome: &str, duration_seconds: f64) {
    let status = outcome.to_string();
    counter!("mcp_host_llm_calls_total", "provider" => provider.to_string(), "outcome" => status)
        .increment(1);
    histogram!("mcp_host_llm_call_duration_seconds", "provider" => provider.to_string())
        .record(duration_seconds);
}

/// RAII timer for a tool call: records the call (success/failure) and its
/// duration when dropped, mirroring `RequestTimer` in the teacher's metrics
/// module.
pub struct ToolCallTimer {
    start: Instant,
    risk_level: String,
    outcome: &'static str,
}

impl ToolCallTimer {
    pub fn start(risk_level: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            risk_level: risk_level.into(),
            outcome: "success",
        }
    }

    pub fn mark_failed(&mut self) {
        self.outcome = "error";
    }
}

impl Drop for ToolCallTimer {
    fn drop(&mut self) {
        record_tool_call(&self.risk_level, self.outcome);
        record_tool_call_duration(&self.risk_level, self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_none_before_init() {
        // `init_metrics` is process-global and other tests in this binary
        // may have already called it; only assert the function doesn't
        // panic either way.
        let _ = metrics_snapshot();
    }

    #[test]
    fn tool_call_timer_defaults_to_success() {
        let timer = ToolCallTimer::start("low");
        assert_eq!(timer.outcome, "success");
    }

    #[test]
    fn tool_call_timer_mark_failed_flips_outcome() {
        let mut timer = ToolCallTimer::start("high");
        timer.mark_failed();
        assert_eq!(timer.outcome, "error");
    }
}

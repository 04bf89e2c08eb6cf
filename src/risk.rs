// src/risk.rs
// Keyword-based risk classifier for tool calls.
//
// Structured the way `llm/router/classifier.rs` structures its tier
// classifier: static keyword arrays checked in a fixed order, first match
// wins. Here the order is mandated by the spec (critical > high > medium >
// low) rather than chosen for routing cost.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The four-valued, totally ordered risk label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    /// Human-readable risk description shown in HITL's UI view.
    pub fn description(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Read-only operation; nothing is modified.",
            RiskLevel::Medium => "May access sensitive data or run a computation.",
            RiskLevel::High => "Will modify data or cause a side effect.",
            RiskLevel::Critical => "Destructive or irreversible; verify every argument.",
        }
    }
}

/// Pure, deterministic classifier over a tool's local name (the
/// `server_key__` prefix must already be stripped by the caller).
pub struct RiskClassifier;

impl RiskClassifier {
    const CRITICAL_KEYWORDS: &'static [&'static str] = &[
        "delete",
        "remove",
        "drop",
        "truncate",
        "destroy",
        "execute",
        "exec",
        "run",
        "eval",
        "shell",
        "command",
        "transfer",
        "payment",
        "transaction",
        "send_money",
    ];

    const HIGH_KEYWORDS: &'static [&'static str] = &[
        "write", "update", "modify", "create", "insert", "edit", "patch", "put", "post",
        "upload", "install", "uninstall", "deploy",
    ];

    const MEDIUM_KEYWORDS: &'static [&'static str] = &[
        "list", "search", "query", "fetch", "download", "export", "generate", "convert",
    ];

    /// Classify a local tool name by keyword, descending risk order, first
    /// match wins.
    pub fn classify(local_name: &str) -> RiskLevel {
        let name = local_name.to_lowercase();

        if Self::CRITICAL_KEYWORDS.iter().any(|k| name.contains(k)) {
            return RiskLevel::Critical;
        }
        if Self::HIGH_KEYWORDS.iter().any(|k| name.contains(k)) {
            return RiskLevel::High;
        }
        if Self::MEDIUM_KEYWORDS.iter().any(|k| name.contains(k)) {
            return RiskLevel::Medium;
        }
        RiskLevel::Low
    }

    /// Classify a call, promoting to `critical` unconditionally if any
    /// extracted path was denied by the Roots registry, regardless of the
    /// keyword match (spec.md §4.B / §8 "risk monotonicity").
    pub fn classify_with_paths(local_name: &str, any_path_denied: bool) -> RiskLevel {
        if any_path_denied {
            return RiskLevel::Critical;
        }
        Self::classify(local_name)
    }
}

/// Policy deciding whether a classified call needs human confirmation.
#[derive(Debug, Clone)]
pub struct ConfirmationPolicy {
    pub confirmation_levels: HashSet<RiskLevel>,
    pub whitelisted_tools: HashSet<String>,
    pub blacklisted_tools: HashSet<String>,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            confirmation_levels: [RiskLevel::High, RiskLevel::Critical].into_iter().collect(),
            whitelisted_tools: HashSet::new(),
            blacklisted_tools: HashSet::new(),
        }
    }
}

impl ConfirmationPolicy {
    /// Whitelist bypasses confirmation first; blacklist forces it second;
    /// otherwise confirmation is required iff `level` is in the configured
    /// set.
    pub fn needs_confirmation(&self, public_tool_name: &str, level: RiskLevel) -> bool {
        if self.whitelisted_tools.contains(public_tool_name) {
            return false;
        }
        if self.blacklisted_tools.contains(public_tool_name) {
            return true;
        }
        self.confirmation_levels.contains(&level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_keywords_win_over_everything() {
        assert_eq!(RiskClassifier::classify("delete_file"), RiskLevel::Critical);
        assert_eq!(RiskClassifier::classify("run_shell_command"), RiskLevel::Critical);
        assert_eq!(RiskClassifier::classify("send_money"), RiskLevel::Critical);
    }

    #[test]
    fn high_keywords() {
        assert_eq!(RiskClassifier::classify("write_file"), RiskLevel::High);
        assert_eq!(RiskClassifier::classify("deploy_service"), RiskLevel::High);
    }

    #[test]
    fn medium_keywords() {
        assert_eq!(RiskClassifier::classify("list_files"), RiskLevel::Medium);
        assert_eq!(RiskClassifier::classify("search_codebase"), RiskLevel::Medium);
    }

    #[test]
    fn low_is_default() {
        assert_eq!(RiskClassifier::classify("echo"), RiskLevel::Low);
        assert_eq!(RiskClassifier::classify("get_time"), RiskLevel::Low);
    }

    #[test]
    fn ordering_is_total() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn denied_path_promotes_to_critical_regardless_of_keyword() {
        assert_eq!(
            RiskClassifier::classify_with_paths("echo", true),
            RiskLevel::Critical
        );
    }

    #[test]
    fn whitelist_bypasses_confirmation() {
        let mut policy = ConfirmationPolicy::default();
        policy.whitelisted_tools.insert("fs__delete_file".to_string());
        assert!(!policy.needs_confirmation("fs__delete_file", RiskLevel::Critical));
    }

    #[test]
    fn blacklist_forces_confirmation_even_for_low_risk() {
        let mut policy = ConfirmationPolicy::default();
        policy.blacklisted_tools.insert("fs__echo".to_string());
        assert!(policy.needs_confirmation("fs__echo", RiskLevel::Low));
    }

    #[test]
    fn default_confirmation_levels_are_high_and_critical() {
        let policy = ConfirmationPolicy::default();
        assert!(!policy.needs_confirmation("fs__list_files", RiskLevel::Medium));
        assert!(policy.needs_confirmation("fs__write_file", RiskLevel::High));
        assert!(policy.needs_confirmation("fs__delete_file", RiskLevel::Critical));
    }
}

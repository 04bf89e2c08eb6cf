// src/config/helpers.rs
// Shared env-var helpers for the config sub-structs.

use std::str::FromStr;

/// Read a required env var, panicking with a descriptive message if absent.
/// Configuration is assembled once at process start; a missing required
/// value is a startup-time operator error, not a recoverable runtime one.
pub fn require_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| panic!("missing required environment variable: {key}"))
}

/// Read an optional env var, falling back to `default` if absent.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read a `bool` env var (`true`/`1`/`yes` case-insensitive), with a default.
pub fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

/// Read a `usize` env var with a default, ignoring unparsable values.
pub fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read a required env var and parse it, panicking on absence or bad format.
pub fn require_env_parsed<T: FromStr>(key: &str) -> T
where
    T::Err: std::fmt::Debug,
{
    require_env(key)
        .parse()
        .unwrap_or_else(|e| panic!("environment variable {key} failed to parse: {e:?}"))
}

/// Read an env var, parsing it, with a default for absence (not for parse failure).
pub fn env_parsed_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

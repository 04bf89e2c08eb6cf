// src/roots/mod.rs
// Roots registry (spec.md §4.A): a path-scoping allow-list, per session plus
// one global set, that can veto any tool argument naming a file outside
// declared workspace roots.
//
// Grounded on `examples/original_source/backend/app/services/roots_service.py`
// for validate_path/extract semantics; structured as a lock-guarded registry
// service the way `sudo/service.rs` structures its permission checks (check
// -> decision enum), using parking_lot the way the teacher's services do.

pub mod path_extract;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{McpCapabilities, RootsCapability};

/// The kind of workspace a declared root represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootKind {
    Project,
    Workspace,
    Resource,
    Custom,
}

/// A declared workspace directory. Identity is the canonical path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Root {
    pub path: PathBuf,
    pub name: Option<String>,
    pub kind: RootKind,
}

impl Root {
    pub fn new(path: PathBuf, name: Option<String>, kind: RootKind) -> Self {
        Self { path, name, kind }
    }

    /// `file://<percent-encoded-absolute-path>` URI form.
    pub fn uri(&self) -> String {
        format!("file://{}", urlencode_path(&self.path))
    }
}

fn urlencode_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Per-session root configuration.
#[derive(Debug, Clone)]
pub struct RootsConfig {
    pub roots: Vec<Root>,
    pub strict_mode: bool,
    pub updated_at: DateTime<Utc>,
}

impl RootsConfig {
    fn new(strict_mode: bool) -> Self {
        Self {
            roots: Vec::new(),
            strict_mode,
            updated_at: Utc::now(),
        }
    }
}

/// Outcome of validating a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Allowed,
    Denied,
    Invalid,
    NoRootsConfigured,
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub path: String,
    pub outcome: ValidationOutcome,
    pub matched_root: Option<PathBuf>,
}

type ChangeCallback = Arc<dyn Fn(&str, &RootsConfig) + Send + Sync>;

/// Owns the global root set plus one `RootsConfig` per session.
pub struct RootsRegistry {
    global: RwLock<RootsConfig>,
    sessions: RwLock<HashMap<String, RootsConfig>>,
    default_strict_mode: bool,
    callbacks: RwLock<Vec<ChangeCallback>>,
}

impl RootsRegistry {
    pub fn new(default_strict_mode: bool) -> Self {
        Self {
            global: RwLock::new(RootsConfig::new(default_strict_mode)),
            sessions: RwLock::new(HashMap::new()),
            default_strict_mode,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback invoked (asynchronously, best-effort) on every
    /// mutation with `(session_id, new_roots)`. A session id of `"*"` means
    /// the global config changed.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(&str, &RootsConfig) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    fn notify(&self, session_id: &str, config: &RootsConfig) {
        for cb in self.callbacks.read().iter() {
            // Callbacks are synchronous closures here; a failing callback
            // (panic) must not block the others, so each is isolated.
            let cb = cb.clone();
            let session_id = session_id.to_string();
            let config = config.clone();
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(&session_id, &config)))
                .ok();
        }
    }

    pub fn configure(&self, session_id: &str, roots: Vec<Root>, strict_mode: bool) {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| RootsConfig::new(self.default_strict_mode));
        entry.roots = roots;
        entry.strict_mode = strict_mode;
        entry.updated_at = Utc::now();
        let snapshot = entry.clone();
        drop(sessions);
        self.notify(session_id, &snapshot);
    }

    pub fn configure_global(&self, roots: Vec<Root>, strict_mode: bool) {
        let mut global = self.global.write();
        global.roots = roots;
        global.strict_mode = strict_mode;
        global.updated_at = Utc::now();
        let snapshot = global.clone();
        drop(global);
        self.notify("*", &snapshot);
    }

    pub fn add(&self, session_id: &str, path: PathBuf, name: Option<String>, kind: RootKind) {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| RootsConfig::new(self.default_strict_mode));
        entry.roots.push(Root::new(path, name, kind));
        entry.updated_at = Utc::now();
        let snapshot = entry.clone();
        drop(sessions);
        self.notify(session_id, &snapshot);
    }

    pub fn remove(&self, session_id: &str, path: &Path) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.roots.retain(|r| r.path != path);
            entry.updated_at = Utc::now();
            let snapshot = entry.clone();
            drop(sessions);
            self.notify(session_id, &snapshot);
        }
    }

    pub fn list(&self, session_id: &str) -> Vec<Root> {
        let global = self.global.read().roots.clone();
        let session = self
            .sessions
            .read()
            .get(session_id)
            .map(|c| c.roots.clone())
            .unwrap_or_default();
        global.into_iter().chain(session).collect()
    }

    fn effective_config(&self, session_id: &str) -> (Vec<Root>, bool) {
        let global = self.global.read();
        let sessions = self.sessions.read();
        match sessions.get(session_id) {
            Some(session_cfg) => {
                let mut roots = global.roots.clone();
                roots.extend(session_cfg.roots.clone());
                (roots, session_cfg.strict_mode)
            }
            None => (global.roots.clone(), global.strict_mode),
        }
    }

    /// Canonicalize (resolve `~`, make absolute, collapse `..`) without
    /// requiring the path to exist on disk, matching the original's
    /// `os.path.abspath(os.path.expanduser(path))` semantics.
    fn canonicalize(raw: &str) -> Option<PathBuf> {
        let expanded = expand_tilde(raw)?;
        let abs = if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir().ok()?.join(expanded)
        };
        Some(normalize_lexically(&abs))
    }

    pub fn validate_path(&self, session_id: &str, path: &str) -> ValidationResult {
        let (roots, strict_mode) = self.effective_config(session_id);

        let canonical = match Self::canonicalize(path) {
            Some(p) => p,
            None => {
                return ValidationResult {
                    path: path.to_string(),
                    outcome: ValidationOutcome::Invalid,
                    matched_root: None,
                }
            }
        };

        if roots.is_empty() {
            let outcome = if strict_mode {
                ValidationOutcome::NoRootsConfigured
            } else {
                ValidationOutcome::Allowed
            };
            return ValidationResult {
                path: path.to_string(),
                outcome,
                matched_root: None,
            };
        }

        for root in &roots {
            if canonical == root.path || canonical.ancestors().any(|a| a == root.path) {
                return ValidationResult {
                    path: path.to_string(),
                    outcome: ValidationOutcome::Allowed,
                    matched_root: Some(root.path.clone()),
                };
            }
        }

        ValidationResult {
            path: path.to_string(),
            outcome: ValidationOutcome::Denied,
            matched_root: None,
        }
    }

    /// Extract path candidates from a tool call's arguments and validate
    /// each. Returns `(all_allowed, results)`.
    pub fn validate_tool_call(
        &self,
        session_id: &str,
        arguments: &Value,
    ) -> (bool, Vec<ValidationResult>) {
        let candidates = path_extract::extract_paths_from_arguments(arguments);
        let results: Vec<ValidationResult> = candidates
            .iter()
            .map(|p| self.validate_path(session_id, p))
            .collect();
        let all_allowed = results
            .iter()
            .all(|r| r.outcome == ValidationOutcome::Allowed);
        (all_allowed, results)
    }

    /// Declares `roots.listChanged` only when the session (or global) has
    /// at least one root configured.
    pub fn capabilities(&self, session_id: &str) -> McpCapabilities {
        let (roots, _) = self.effective_config(session_id);
        McpCapabilities {
            roots: if roots.is_empty() {
                None
            } else {
                Some(RootsCapability { list_changed: true })
            },
            ..Default::default()
        }
    }
}

fn expand_tilde(raw: &str) -> Option<PathBuf> {
    if let Some(rest) = raw.strip_prefix('~') {
        let home = dirs_home()?;
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        Some(if rest.is_empty() { home } else { home.join(rest) })
    } else {
        Some(PathBuf::from(raw))
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Lexically collapse `.`/`..` components without touching the filesystem
/// (the path may not exist yet, e.g. a file about to be written).
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        use std::path::Component::*;
        match component {
            ParentDir => {
                out.pop();
            }
            CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_roots_strict_denies() {
        let registry = RootsRegistry::new(true);
        let result = registry.validate_path("s1", "/tmp/foo");
        assert_eq!(result.outcome, ValidationOutcome::NoRootsConfigured);
    }

    #[test]
    fn empty_roots_non_strict_allows() {
        let registry = RootsRegistry::new(false);
        let result = registry.validate_path("s1", "/tmp/foo");
        assert_eq!(result.outcome, ValidationOutcome::Allowed);
    }

    #[test]
    fn path_within_root_is_allowed() {
        let registry = RootsRegistry::new(true);
        registry.configure(
            "s1",
            vec![Root::new(PathBuf::from("/project"), None, RootKind::Project)],
            true,
        );
        let result = registry.validate_path("s1", "/project/src/main.rs");
        assert_eq!(result.outcome, ValidationOutcome::Allowed);
    }

    #[test]
    fn path_outside_root_is_denied() {
        let registry = RootsRegistry::new(true);
        registry.configure(
            "s1",
            vec![Root::new(PathBuf::from("/project"), None, RootKind::Project)],
            true,
        );
        let result = registry.validate_path("s1", "/etc/hosts");
        assert_eq!(result.outcome, ValidationOutcome::Denied);
    }

    #[test]
    fn exact_root_path_is_allowed() {
        let registry = RootsRegistry::new(true);
        registry.configure(
            "s1",
            vec![Root::new(PathBuf::from("/project"), None, RootKind::Project)],
            true,
        );
        let result = registry.validate_path("s1", "/project");
        assert_eq!(result.outcome, ValidationOutcome::Allowed);
    }

    #[test]
    fn global_roots_apply_to_every_session() {
        let registry = RootsRegistry::new(true);
        registry.configure_global(
            vec![Root::new(PathBuf::from("/shared"), None, RootKind::Workspace)],
            true,
        );
        let result = registry.validate_path("any-session", "/shared/data.txt");
        assert_eq!(result.outcome, ValidationOutcome::Allowed);
    }

    #[test]
    fn dotdot_is_collapsed_before_matching() {
        let registry = RootsRegistry::new(true);
        registry.configure(
            "s1",
            vec![Root::new(PathBuf::from("/project"), None, RootKind::Project)],
            true,
        );
        let result = registry.validate_path("s1", "/project/sub/../../etc/hosts");
        assert_eq!(result.outcome, ValidationOutcome::Denied);
    }

    #[test]
    fn validate_tool_call_all_allowed() {
        let registry = RootsRegistry::new(false);
        let (ok, results) = registry.validate_tool_call("s1", &json!({"path": "/tmp/x"}));
        assert!(ok);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn validate_tool_call_any_denied_fails() {
        let registry = RootsRegistry::new(true);
        registry.configure(
            "s1",
            vec![Root::new(PathBuf::from("/project"), None, RootKind::Project)],
            true,
        );
        let (ok, results) =
            registry.validate_tool_call("s1", &json!({"path": "/etc/hosts", "note": "safe"}));
        assert!(!ok);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, ValidationOutcome::Denied);
    }

    #[test]
    fn add_then_remove_is_idempotent() {
        let registry = RootsRegistry::new(true);
        let path = PathBuf::from("/project");
        registry.add("s1", path.clone(), None, RootKind::Project);
        assert_eq!(registry.list("s1").len(), 1);
        registry.remove("s1", &path);
        assert_eq!(registry.list("s1").len(), 0);
    }

    #[test]
    fn capabilities_declare_listchanged_only_when_configured() {
        let registry = RootsRegistry::new(true);
        assert!(registry.capabilities("s1").roots.is_none());
        registry.add("s1", PathBuf::from("/project"), None, RootKind::Project);
        assert!(registry.capabilities("s1").roots.unwrap().list_changed);
    }

    #[test]
    fn change_callback_fires_on_mutation() {
        let registry = RootsRegistry::new(true);
        let seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen2 = seen.clone();
        registry.on_change(move |_sid, _cfg| {
            seen2.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        registry.add("s1", PathBuf::from("/project"), None, RootKind::Project);
        assert!(seen.load(std::sync::atomic::Ordering::SeqCst));
    }
}

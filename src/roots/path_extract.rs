// src/roots/path_extract.rs
// Recursive argument walker that finds path-like candidates in a tool's
// JSON arguments. Mirrors `roots_service.py::extract_paths_from_arguments`:
// a static reserved-key set plus a permissive bare-string heuristic,
// recursion capped at depth 6 (spec.md's own invariant governs over the
// original's depth-5 cap; see SPEC_FULL.md §13 resolution #1).

use serde_json::Value;

/// Reserved argument keys (case-insensitive) whose string value(s) are
/// always treated as path candidates. Kept as a static constant so it is
/// never recompiled per call (spec.md §9 redesign note).
const RESERVED_PATH_KEYS: &[&str] = &[
    "path",
    "file",
    "filepath",
    "filename",
    "file_path",
    "uri",
    "url",
    "source",
    "target",
    "destination",
    "dest",
    "input",
    "output",
    "directory",
    "dir",
    "folder",
    "location",
    "resource",
];

const MAX_DEPTH: usize = 6;

/// Returns true if `s` looks like a path: contains `/` or `\`, or starts
/// with `~`. Deliberately permissive — it over-triggers on URLs and
/// natural-language fragments, matching the original's kept-as-is behavior.
fn looks_like_path(s: &str) -> bool {
    s.contains('/') || s.contains('\\') || s.starts_with('~')
}

fn is_reserved_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    RESERVED_PATH_KEYS.iter().any(|k| *k == lower)
}

/// Walk `arguments` recursively and collect every path candidate string.
pub fn extract_paths_from_arguments(arguments: &Value) -> Vec<String> {
    let mut out = Vec::new();
    walk(arguments, None, 0, &mut out);
    out
}

fn walk(value: &Value, parent_key: Option<&str>, depth: usize, out: &mut Vec<String>) {
    if depth > MAX_DEPTH {
        return;
    }

    match value {
        Value::String(s) => {
            let reserved = parent_key.map(is_reserved_key).unwrap_or(false);
            if reserved || looks_like_path(s) {
                out.push(s.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, parent_key, depth + 1, out);
            }
        }
        Value::Object(map) => {
            for (key, val) in map {
                walk(val, Some(key.as_str()), depth + 1, out);
            }
        }
        _ => {}
    }
}

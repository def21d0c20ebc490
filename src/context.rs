//! Operator overrides and the per-request evaluation context.

use std::collections::HashMap;

/// Operator-declared template variables (`-v BASE_IP=10.0.0.1`).
///
/// Built once at startup and shared read-only by every route afterwards.
pub type KeyValue = HashMap<String, String>;

/// Builds the context a nested URL template is evaluated against.
///
/// Overrides go in first and path variables second, so a placeholder named
/// like an override shadows it for that request.
pub fn merge(kv: &KeyValue, path_vars: &HashMap<String, String>) -> HashMap<String, String> {
    let mut vars = HashMap::with_capacity(kv.len() + path_vars.len());
    for (key, value) in kv {
        vars.insert(key.clone(), value.clone());
    }
    for (key, value) in path_vars {
        vars.insert(key.clone(), value.clone());
    }
    vars
}

/// Parses one `KEY=VALUE` pair, trimming whitespace around both halves.
///
/// Returns `None` when there is no `=`. Only the first `=` splits, so values
/// may themselves contain `=`.
pub fn parse_pair(pair: &str) -> Option<(String, String)> {
    let (key, value) = pair.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_owned(), value.trim().to_owned()))
}

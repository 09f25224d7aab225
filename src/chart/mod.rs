//! Schemaless patching of a release's config tree.
//!
//! A release config is a JSON document whose shape is user-defined; the only
//! structure this module relies on is the `_config` subtree at each chart
//! level and the `_metadata.revision` counter inside it.

use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("config path is empty")]
    EmptyPath,

    #[error("replacement value has no `_config` subtree")]
    MissingConfig,

    #[error("no sub-config found at {0:?}")]
    MissingSubConfig(String),

    #[error("controller name is not a string")]
    InvalidControllerName,

    #[error("invalid config document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Replace the `_config` subtree at `path` inside `origin` with the one from
/// `new_value`, bumping `_metadata.revision` (absent → 2, else previous + 1).
///
/// If the replacement carries a controller name at
/// `controllers[0].controller.name`, the name is rebuilt with `suffix` so the
/// canary controller does not collide with the origin's. When `suffix` is
/// `None` the new revision number is used.
///
/// The first segment of `path` addresses the release itself and is skipped;
/// the remaining segments walk sub-charts.
pub fn replace_config(
    origin: &str,
    path: &str,
    new_value: &str,
    suffix: Option<&str>,
) -> Result<String, ChartError> {
    if path.is_empty() {
        return Err(ChartError::EmptyPath);
    }

    let mut origin_doc: Value = serde_json::from_str(origin)?;
    let new_doc: Value = serde_json::from_str(new_value)?;

    let mut replacement = new_doc
        .get("_config")
        .cloned()
        .ok_or(ChartError::MissingConfig)?;

    // the first path segment is the release itself, skip it
    let mut segments: Vec<&str> = path.split('/').skip(1).collect();
    segments.push("_config");

    let existing = value_at(&origin_doc, &segments)
        .ok_or_else(|| ChartError::MissingSubConfig(path.to_string()))?;

    let revision = existing
        .get("_metadata")
        .and_then(|m| m.get("revision"))
        .and_then(Value::as_i64)
        .map(|r| r + 1)
        .unwrap_or(2);

    set_at(&mut replacement, &["_metadata", "revision"], json!(revision));

    let controller_name = match replacement.pointer("/controllers/0/controller/name") {
        None => None,
        Some(Value::String(name)) => Some(name.clone()),
        Some(_) => return Err(ChartError::InvalidControllerName),
    };
    if let Some(name) = controller_name.filter(|name| !name.is_empty()) {
        let suffix = suffix
            .map(str::to_string)
            .unwrap_or_else(|| revision.to_string());
        set_at_pointer(
            &mut replacement,
            &["controllers", "0", "controller", "name"],
            Value::String(rebuild_controller_name(&name, &suffix)),
        );
    }

    set_value_at(&mut origin_doc, &segments, replacement);
    Ok(serde_json::to_string(&origin_doc)?)
}

/// Rebuild a controller name with a new trailing suffix.
///
/// Single-segment names get the suffix appended. Otherwise the trailing
/// segment is replaced when its length equals the suffix's (which makes the
/// rebuild idempotent), and the suffix is appended when it does not.
pub fn rebuild_controller_name(name: &str, suffix: &str) -> String {
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() == 1 {
        return format!("{}-{}", name, suffix);
    }
    let last = parts[parts.len() - 1];
    if last.len() != suffix.len() {
        return format!("{}-{}", name, suffix);
    }
    let mut parts = parts;
    let end = parts.len() - 1;
    parts[end] = suffix;
    parts.join("-")
}

fn value_at<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = doc;
    for seg in path {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

/// Write `value` at `path`, creating intermediate objects as needed.
fn set_at(doc: &mut Value, path: &[&str], value: Value) {
    let mut cur = doc;
    for seg in &path[..path.len() - 1] {
        if !cur.is_object() {
            *cur = json!({});
        }
        let map = match cur.as_object_mut() {
            Some(map) => map,
            None => return,
        };
        cur = map.entry(seg.to_string()).or_insert(json!({}));
    }
    if !cur.is_object() {
        *cur = json!({});
    }
    if let Some(map) = cur.as_object_mut() {
        map.insert(path[path.len() - 1].to_string(), value);
    }
}

/// Like [`set_at`] but treats numeric segments as array indices; only used
/// for paths already proven to exist.
fn set_at_pointer(doc: &mut Value, path: &[&str], value: Value) {
    let pointer = format!("/{}", path.join("/"));
    if let Some(slot) = doc.pointer_mut(&pointer) {
        *slot = value;
    }
}

/// Replace the value at an existing object path.
fn set_value_at(doc: &mut Value, path: &[&str], value: Value) {
    let mut cur = doc;
    for seg in &path[..path.len() - 1] {
        match cur.get_mut(seg) {
            Some(next) => cur = next,
            None => return,
        }
    }
    if let Some(map) = cur.as_object_mut() {
        map.insert(path[path.len() - 1].to_string(), value);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "chart_test.rs"]
mod tests;

//! Manifest handling and the chart renderer seam.
//!
//! The chart renderer itself belongs to the orchestrator; this module only
//! defines the interface the proxy agent consumes ([`Renderer`]) plus the
//! manifest plumbing around it: multi-document splitting/merging and the
//! [`Carrier`], which locates the resources of one sub-chart inside a
//! rendered manifest through the `# Source: <path>` comment convention.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::core::DynamicObject;
use serde_json::Value;
use tera::Tera;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template render failed: {0}")]
    Template(#[from] tera::Error),

    #[error("invalid manifest document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("service {0:?} not found in rendered objects")]
    ServiceNotFound(String),

    #[error("no resources found at path {0:?}")]
    PathNotFound(String),
}

/// Options for one render pass.
pub struct RenderOptions<'a> {
    pub namespace: &'a str,
    pub release: &'a str,
    pub version: i64,
    pub template: &'a str,
    pub config: &'a str,
}

/// The chart renderer the agent delegates to.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, opts: &RenderOptions<'_>) -> Result<Carrier, RenderError>;
}

/// A rendered manifest indexed by sub-chart path.
pub struct Carrier {
    docs: Vec<CarrierDoc>,
}

struct CarrierDoc {
    source: Option<String>,
    body: String,
}

impl Carrier {
    /// Parse a multi-document manifest, recording each document's
    /// `# Source:` origin.
    pub fn from_manifest(manifest: &str) -> Self {
        let docs = split_manifest(manifest)
            .into_iter()
            .map(|body| CarrierDoc {
                source: doc_source(&body),
                body,
            })
            .collect();
        Carrier { docs }
    }

    /// Documents rendered from the sub-chart at `path` (or below it).
    ///
    /// Documents without a source annotation belong to the release root and
    /// only match the single-segment root path.
    pub fn resources_of(&self, path: &str) -> Result<Vec<String>, RenderError> {
        let root = !path.contains('/');
        let selected: Vec<String> = self
            .docs
            .iter()
            .filter(|doc| match &doc.source {
                Some(source) => {
                    source == path || source.starts_with(&format!("{}/", path))
                }
                None => root,
            })
            .map(|doc| doc.body.clone())
            .collect();

        if selected.is_empty() {
            return Err(RenderError::PathNotFound(path.to_string()));
        }
        Ok(selected)
    }
}

/// Split a multi-document YAML manifest into trimmed documents, dropping
/// empty ones.
pub fn split_manifest(manifest: &str) -> Vec<String> {
    let mut docs = Vec::new();
    for chunk in manifest.split("\n---") {
        let chunk = chunk.strip_prefix("---").unwrap_or(chunk);
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            docs.push(trimmed.to_string());
        }
    }
    docs
}

/// Join documents back into one manifest.
pub fn merge_manifest(docs: &[String]) -> String {
    docs.join("\n---\n")
}

fn doc_source(doc: &str) -> Option<String> {
    for line in doc.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("# Source:") {
            return Some(rest.trim().to_string());
        }
        if !line.is_empty() && !line.starts_with('#') {
            break;
        }
    }
    None
}

/// Decode one manifest document into a dynamic object.
pub fn decode_object(doc: &str) -> Result<DynamicObject, RenderError> {
    Ok(serde_yaml::from_str(doc)?)
}

/// Round-trip a document through the YAML codec, dropping comments and
/// normalizing formatting so manifests diff reliably.
pub fn normalize_doc(doc: &str) -> Result<String, RenderError> {
    let value: serde_yaml::Value = serde_yaml::from_str(doc)?;
    let out = serde_yaml::to_string(&value)?;
    Ok(out.trim().to_string())
}

/// Find the Service named `name` among rendered documents.
pub fn find_service(docs: &[String], name: &str) -> Result<Service, RenderError> {
    for doc in docs {
        let value: Value = serde_yaml::from_str::<serde_json::Value>(doc)?;
        let kind = value.get("kind").and_then(Value::as_str);
        let doc_name = value.pointer("/metadata/name").and_then(Value::as_str);
        if kind == Some("Service") && doc_name == Some(name) {
            return Ok(serde_json::from_value(value)?);
        }
    }
    Err(RenderError::ServiceNotFound(name.to_string()))
}

/// Default renderer: treats the release template as a Tera template over the
/// config document.
///
/// Context variables: `namespace`, `release`, `version` and the parsed
/// `config` tree.
pub struct TeraRenderer;

#[async_trait]
impl Renderer for TeraRenderer {
    async fn render(&self, opts: &RenderOptions<'_>) -> Result<Carrier, RenderError> {
        let mut tera = Tera::default();
        tera.add_raw_template("release", opts.template)?;

        let config: Value = if opts.config.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(opts.config)?
        };

        let mut ctx = tera::Context::new();
        ctx.insert("namespace", opts.namespace);
        ctx.insert("release", opts.release);
        ctx.insert("version", &opts.version);
        ctx.insert("config", &config);

        let manifest = tera.render("release", &ctx)?;
        Ok(Carrier::from_manifest(&manifest))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "render_test.rs"]
mod tests;

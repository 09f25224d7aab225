//! Rendering of the nginx configuration from its on-disk template.
//!
//! The template ships with the proxy image at
//! `/etc/nginx/template/nginx.tmpl`; edits to the file hot-swap the compiled
//! template so the next reload picks them up.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use tera::Tera;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::nginx::config::TemplateConfig;
use crate::nginx::NginxError;

const TEMPLATE_NAME: &str = "nginx.tmpl";

/// A compiled nginx configuration template.
pub struct NginxTemplate {
    tera: Tera,
}

impl NginxTemplate {
    pub fn from_file(path: &Path) -> Result<Self, NginxError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_str(&raw)
    }

    pub fn from_str(raw: &str) -> Result<Self, NginxError> {
        let mut tera = Tera::default();
        tera.add_raw_template(TEMPLATE_NAME, raw)?;
        Ok(NginxTemplate { tera })
    }

    /// Render the configuration and squeeze the blank lines the template's
    /// conditionals leave behind.
    pub fn write(&self, cfg: &TemplateConfig) -> Result<String, NginxError> {
        let ctx = tera::Context::from_serialize(cfg)?;
        let rendered = self.tera.render(TEMPLATE_NAME, &ctx)?;
        Ok(squeeze_blank_lines(&rendered))
    }
}

/// Collapse runs of blank lines into a single one.
pub fn squeeze_blank_lines(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut blank_run = 0usize;
    for line in input.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank_run = 0;
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Watch the template file and swap the compiled template on change.
///
/// The returned watcher must be kept alive for the watch to stay active. A
/// template that no longer parses is rejected; the previous one stays in
/// service.
pub fn watch_template(
    path: &Path,
    shared: Arc<RwLock<NginxTemplate>>,
) -> Result<RecommendedWatcher, NginxError> {
    let watched = path.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                error!(error = %err, "template watch error");
                return;
            }
        };
        if !event.kind.is_modify() && !event.kind.is_create() {
            return;
        }
        match NginxTemplate::from_file(&watched) {
            Ok(tmpl) => {
                *shared.blocking_write() = tmpl;
                info!(path = %watched.display(), "new nginx template loaded");
            }
            Err(err) => {
                error!(error = %err, "error loading new template, keeping previous");
            }
        }
    })?;

    watcher.watch(path, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "template_test.rs"]
mod tests;

//! Per-canary proxy agent.
//!
//! One agent runs inside each proxy pod. It reconciles exactly one
//! CanaryRelease: rendering the origin and canary variants of the targeted
//! sub-chart, forking services, steering traffic through the local nginx,
//! and executing the adopt/deprecate transition.

pub mod reconcile;
pub mod transition;

use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::applier::{Applier, ApplyError, ClientPool};
use crate::chart::ChartError;
use crate::crd::{CanaryRelease, CanaryTransition, Release};
use crate::nginx::config::TemplateConfig;
use crate::nginx::{NginxController, NginxError};
use crate::render::{RenderError, Renderer};
use crate::server::SharedMetrics;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Chart(#[from] ChartError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("nginx error: {0}")]
    Nginx(#[from] NginxError),

    #[error("CanaryRelease missing namespace")]
    MissingNamespace,

    #[error("service {0:?} not found in cluster")]
    ServiceMissing(String),
}

/// Shared state of the single-canary reconciler.
pub struct AgentContext {
    pub client: Client,
    pub applier: Applier,
    pub pool: ClientPool,
    pub renderer: Arc<dyn Renderer>,
    pub nginx: Arc<NginxController>,
    pub metrics: SharedMetrics,

    /// Identity of the one canary this agent serves
    pub namespace: String,
    pub canary_release: String,
    pub release: String,

    /// Config currently loaded into nginx; written only by the single
    /// reconciler worker
    pub running_config: Mutex<Option<TemplateConfig>>,
    /// Set once the terminal transition finished; unblocks shutdown
    pub exiting: AtomicBool,
}

impl AgentContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        renderer: Arc<dyn Renderer>,
        nginx: Arc<NginxController>,
        metrics: SharedMetrics,
        namespace: String,
        canary_release: String,
        release: String,
    ) -> Self {
        let pool = ClientPool::new(client.clone());
        AgentContext {
            client: client.clone(),
            applier: Applier::new(pool.clone()),
            pool,
            renderer,
            nginx,
            metrics,
            namespace,
            canary_release,
            release,
            running_config: Mutex::new(None),
            exiting: AtomicBool::new(false),
        }
    }

    pub fn cr_api(&self) -> Api<CanaryRelease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn release_api(&self) -> Api<Release> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Requeue with a delay on reconcile errors.
pub fn error_policy(cr: Arc<CanaryRelease>, error: &AgentError, ctx: Arc<AgentContext>) -> Action {
    warn!(canary = %cr.name_any(), "reconcile error (will retry): {:?}", error);
    ctx.metrics.record_reconcile_error("proxy");
    Action::requeue(Duration::from_secs(10))
}

/// Reconcile the agent's CanaryRelease.
///
/// This function is never invoked concurrently for the same object; the
/// controller runtime serializes reconciles per key, and this agent watches
/// a single key.
pub async fn reconcile(
    cr: Arc<CanaryRelease>,
    ctx: Arc<AgentContext>,
) -> Result<Action, AgentError> {
    let started = std::time::Instant::now();
    let result = reconcile_inner(cr, &ctx).await;
    ctx.metrics
        .observe_reconcile_duration("proxy", started.elapsed().as_secs_f64());
    result
}

async fn reconcile_inner(
    cr: Arc<CanaryRelease>,
    ctx: &Arc<AgentContext>,
) -> Result<Action, AgentError> {
    // events are filtered by field selector already; this guards against a
    // misconfigured watch
    if cr.name_any() != ctx.canary_release
        || cr.namespace().as_deref() != Some(ctx.namespace.as_str())
    {
        return Ok(Action::await_change());
    }

    if cr.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    // a finished canary is no longer ours to touch
    let phase = cr
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(CanaryTransition::None);
    if phase != CanaryTransition::None {
        return Ok(Action::await_change());
    }

    // user (or controller) asked for a terminal transition
    if cr.spec.transition != CanaryTransition::None {
        let action = transition::cleanup(&cr, ctx).await?;
        ctx.metrics.record_reconcile_success("proxy");
        return Ok(action);
    }

    let release = match ctx.release_api().get_opt(&cr.spec.release).await? {
        None => {
            info!(canary = %cr.name_any(), "release is gone, deprecating this canary");
            deprecate(ctx, &cr).await?;
            return Ok(Action::await_change());
        }
        Some(release) => release,
    };

    let release_version = release.status.as_ref().map(|s| s.version).unwrap_or(0);
    if release_version != cr.spec.version {
        info!(
            release_version,
            canary_version = cr.spec.version,
            "release version drifted, deprecating this canary"
        );
        deprecate(ctx, &cr).await?;
        return Ok(Action::await_change());
    }

    reconcile::sync(&cr, &release, ctx).await?;
    ctx.metrics.record_reconcile_success("proxy");
    Ok(Action::requeue(Duration::from_secs(300)))
}

/// Patch `spec.transition` to Deprecated; cleanup happens on the next
/// iteration.
pub async fn deprecate(ctx: &AgentContext, cr: &CanaryRelease) -> Result<(), AgentError> {
    if cr.spec.transition != CanaryTransition::None {
        return Ok(());
    }
    let patch = serde_json::json!({"spec": {"transition": CanaryTransition::Deprecated}});
    ctx.cr_api()
        .patch(
            &cr.name_any(),
            &kube::api::PatchParams::default(),
            &kube::api::Patch::Merge(&patch),
        )
        .await?;
    Ok(())
}

/// Give an in-flight transition time to finish before shutdown.
///
/// Polls once a second for up to 20 seconds, returning early when the
/// transition completed, the CR is gone, or no transition is pending.
pub async fn wait_for_cleanup(ctx: &AgentContext) {
    for _ in 0..20 {
        if ctx.exiting.load(Ordering::SeqCst) {
            return;
        }
        match ctx.cr_api().get_opt(&ctx.canary_release).await {
            Ok(None) => return,
            Ok(Some(cr)) if cr.spec.transition == CanaryTransition::None => return,
            Ok(Some(_)) => {}
            Err(err) => {
                warn!(error = %err, "error polling canary release during shutdown");
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

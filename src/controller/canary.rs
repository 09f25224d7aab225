use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::ResourceExt;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::controller::claim::claim_deployments;
use crate::controller::status::sync_status;
use crate::controller::Context;
use crate::crd::{
    canary_owner_reference, created_by_value, new_condition, new_error_condition, CanaryRelease,
    CanaryTransition, Release, LABEL_CREATED_BY, REASON_CREATING, REASON_ERROR,
};
use crate::retry::add_condition;

pub const PROXY_NAME_SUFFIX: &str = "-proxy";
const CLEANUP_FINALIZER: &str = "canary.peippo.io/cleanup";

/// Grace given to proxy pods when a canary is torn down.
const CLEANUP_GRACE_SECONDS: u32 = 60;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("CanaryRelease missing namespace")]
    MissingNamespace,

    #[error("original CanaryRelease {0} is gone")]
    CanaryGone(String),

    #[error("adoption refused: {0}")]
    AdoptionRefused(String),

    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<ReconcileError>>),
}

/// Requeue with a delay on reconcile errors.
///
/// Uses `warn!` since reconciliation errors are expected and trigger retries.
pub fn error_policy(cr: Arc<CanaryRelease>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    warn!(canary = %cr.name_any(), "reconcile error (will retry): {:?}", error);
    ctx.metrics.record_reconcile_error("canary");
    Action::requeue(Duration::from_secs(10))
}

/// Reconcile one CanaryRelease.
///
/// The finalizer runs the cleanup branch before the CR disappears, so stray
/// proxy deployments never outlive their canary.
pub async fn reconcile(
    cr: Arc<CanaryRelease>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let started = std::time::Instant::now();
    let namespace = cr.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let api: Api<CanaryRelease> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&api, CLEANUP_FINALIZER, cr, |event| async {
        match event {
            FinalizerEvent::Apply(cr) => apply(cr, &ctx).await,
            FinalizerEvent::Cleanup(cr) => {
                info!(canary = %cr.name_any(), "CanaryRelease deleted, cleaning up proxies");
                delete_proxy_deployments(&ctx, &cr).await?;
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|err| ReconcileError::Finalizer(Box::new(err)));

    ctx.metrics
        .observe_reconcile_duration("canary", started.elapsed().as_secs_f64());
    result
}

async fn apply(cr: Arc<CanaryRelease>, ctx: &Context) -> Result<Action, ReconcileError> {
    let name = cr.name_any();
    let namespace = cr.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let cr_api: Api<CanaryRelease> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(canary = %name, namespace = %namespace, "reconciling CanaryRelease");

    // the created-by label joins namespace and name with a dot, so dotted
    // names cannot be reverse-resolved
    if name.contains('.') {
        warn!(canary = %name, "CanaryRelease name contains a dot, dropping");
        let condition = new_condition(REASON_ERROR, "CanaryRelease names must not contain a dot");
        let _ = add_condition(&cr_api, &name, condition).await;
        return Ok(Action::await_change());
    }

    // the canary finished its transition; only the proxy is left to remove
    if phase_of(&cr) != CanaryTransition::None {
        info!(canary = %name, "canary already adopted/deprecated, cleaning up proxies");
        delete_proxy_deployments(ctx, &cr).await?;
        return Ok(Action::await_change());
    }

    let release_api: Api<Release> = Api::namespaced(ctx.client.clone(), &namespace);
    match release_api.get_opt(&cr.spec.release).await? {
        None => {
            info!(canary = %name, release = %cr.spec.release, "release is gone, deprecating");
            deprecate(ctx, &cr).await?;
            return Ok(Action::await_change());
        }
        Some(release) => {
            let release_version = release.status.as_ref().map(|s| s.version).unwrap_or(0);
            if release_version != cr.spec.version {
                info!(
                    canary = %name,
                    release_version,
                    canary_version = cr.spec.version,
                    "release version drifted, deprecating"
                );
                deprecate(ctx, &cr).await?;
                return Ok(Action::await_change());
            }
        }
    }

    let deployments = claim_deployments(ctx, &cr).await?;

    let result = sync(ctx, &cr, deployments).await;
    if let Err(err) = &result {
        let _ = add_condition(&cr_api, &name, new_error_condition(err)).await;
    }
    result?;

    ctx.metrics.record_reconcile_success("canary");
    Ok(Action::requeue(Duration::from_secs(300)))
}

/// Keep exactly one proxy deployment: the first claimed one carrying the
/// canonical name prefix. Everything else claimed is deleted, and a missing
/// proxy is created.
async fn sync(
    ctx: &Context,
    cr: &CanaryRelease,
    deployments: Vec<Deployment>,
) -> Result<(), ReconcileError> {
    let name = cr.name_any();
    let namespace = cr.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let cr_api: Api<CanaryRelease> = Api::namespaced(ctx.client.clone(), &namespace);

    let prefix = format!("{}{}", name, PROXY_NAME_SUFFIX);
    let mut active: Option<Deployment> = None;

    for dp in deployments {
        // two conditions demote a claimed deployment: it lacks the canonical
        // name prefix, or another proxy already survived this pass
        if !dp.name_any().starts_with(&prefix) || active.is_some() {
            warn!(canary = %name, deployment = %dp.name_any(), "deleting unexpected proxy");
            match api.delete(&dp.name_any(), &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(err) => return Err(err.into()),
            }
            continue;
        }
        active = Some(dp);
    }

    let active = match active {
        Some(active) => active,
        None => {
            let desired = generate_deployment(cr, &ctx.proxy_image);
            add_condition(&cr_api, &name, new_condition(REASON_CREATING, "")).await?;
            info!(canary = %name, deployment = %desired.name_any(), "creating proxy deployment");
            api.create(&PostParams::default(), &desired).await?;
            desired
        }
    };

    sync_status(ctx, cr, &active).await
}

/// Patch `spec.transition` to Deprecated; the next iteration cleans up.
pub async fn deprecate(ctx: &Context, cr: &CanaryRelease) -> Result<(), ReconcileError> {
    if cr.spec.transition != CanaryTransition::None {
        return Ok(());
    }
    let namespace = cr.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let api: Api<CanaryRelease> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = json!({"spec": {"transition": CanaryTransition::Deprecated}});
    api.patch(
        &cr.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Delete every deployment bearing the canary's created-by label, with
/// background propagation and a draining grace period. Idempotent.
pub async fn delete_proxy_deployments(
    ctx: &Context,
    cr: &CanaryRelease,
) -> Result<(), ReconcileError> {
    let namespace = cr.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);

    let selector = format!(
        "{}={}",
        LABEL_CREATED_BY,
        created_by_value(&namespace, &cr.name_any())
    );
    let list = api.list(&ListParams::default().labels(&selector)).await?;

    let dp_params = DeleteParams::background().grace_period(CLEANUP_GRACE_SECONDS);
    for dp in list {
        match api.delete(&dp.name_any(), &dp_params).await {
            Ok(_) => info!(deployment = %dp.name_any(), "deleted proxy deployment"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(err) => {
                warn!(deployment = %dp.name_any(), error = %err, "error cleaning up proxy");
                return Err(err.into());
            }
        }
    }
    Ok(())
}

/// The canonical proxy Deployment for a canary.
pub fn generate_deployment(cr: &CanaryRelease, proxy_image: &str) -> Deployment {
    let name = cr.name_any();
    let namespace = cr.namespace().unwrap_or_default();

    let labels: BTreeMap<String, String> = [(
        LABEL_CREATED_BY.to_string(),
        created_by_value(&namespace, &name),
    )]
    .into();

    let env = vec![
        EnvVar {
            name: "CANARY_RELEASE_NAME".to_string(),
            value: Some(name.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "CANARY_RELEASE_NAMESPACE".to_string(),
            value: Some(namespace.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "RELEASE_NAME".to_string(),
            value: Some(cr.spec.release.clone()),
            ..Default::default()
        },
    ];

    Deployment {
        metadata: ObjectMeta {
            name: Some(format!("{}{}", name, PROXY_NAME_SUFFIX)),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            owner_references: Some(vec![canary_owner_reference(cr)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    termination_grace_period_seconds: Some(60),
                    containers: vec![Container {
                        name: "canary-proxy".to_string(),
                        image: Some(proxy_image.to_string()),
                        image_pull_policy: Some("Always".to_string()),
                        resources: cr.spec.resources.clone(),
                        env: Some(env),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

pub(crate) fn phase_of(cr: &CanaryRelease) -> CanaryTransition {
    cr.status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(CanaryTransition::None)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "canary_test.rs"]
mod tests;

//! Aggregation of proxy pod state into the CanaryRelease status.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use tracing::{debug, error};

use crate::controller::canary::ReconcileError;
use crate::controller::Context;
use crate::crd::{
    created_by_value, new_condition, CanaryRelease, CanaryReleaseProxyStatus, PodStatus,
    LABEL_CREATED_BY, REASON_UPDATING,
};
use crate::retry::update_status_with_retries;

/// Categorize one proxy pod.
pub fn judge_pod(pod: &Pod) -> PodStatus {
    let status = pod.status.clone().unwrap_or_default();
    let container_statuses = status.container_statuses.unwrap_or_default();

    let total_containers = container_statuses.len() as i32;
    let ready_containers = container_statuses.iter().filter(|c| c.ready).count() as i32;
    let restart_count = container_statuses.iter().map(|c| c.restart_count).sum();

    let ready = status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True");

    // a waiting container carries the most useful reason/message
    let waiting = container_statuses
        .iter()
        .find_map(|c| c.state.as_ref().and_then(|s| s.waiting.clone()));
    let reason = status
        .reason
        .or_else(|| waiting.as_ref().and_then(|w| w.reason.clone()))
        .unwrap_or_default();
    let message = status
        .message
        .or_else(|| waiting.as_ref().and_then(|w| w.message.clone()))
        .unwrap_or_default();

    PodStatus {
        name: pod.name_any(),
        ready,
        restart_count,
        ready_containers,
        total_containers,
        node_name: pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default(),
        phase: status.phase.unwrap_or_default(),
        reason,
        message,
    }
}

/// Aggregate the active deployment and its pods, sorted by pod name.
pub fn aggregate_proxy_status(active: &Deployment, pods: &[Pod]) -> CanaryReleaseProxyStatus {
    let mut proxy = CanaryReleaseProxyStatus {
        deployment: active.name_any(),
        replicas: active.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
        ..Default::default()
    };

    for pod in pods {
        let status = judge_pod(pod);
        proxy.total_replicas += 1;
        if status.ready {
            proxy.ready_replicas += 1;
        }
        proxy.pod_statuses.push(status);
    }

    proxy.pod_statuses.sort_by(|a, b| a.name.cmp(&b.name));
    proxy
}

/// Compare the freshly aggregated proxy status against the stored one and
/// push an update (with conflict retries) only when they differ.
pub async fn sync_status(
    ctx: &Context,
    cr: &CanaryRelease,
    active: &Deployment,
) -> Result<(), ReconcileError> {
    let namespace = cr.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let name = cr.name_any();

    let pod_api: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let selector = format!(
        "{}={}",
        LABEL_CREATED_BY,
        created_by_value(&namespace, &name)
    );
    let pods = pod_api
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;

    let proxy = aggregate_proxy_status(active, &pods);

    let mut current = cr
        .status
        .as_ref()
        .map(|s| s.proxy.clone())
        .unwrap_or_default();
    current.pod_statuses.sort_by(|a, b| a.name.cmp(&b.name));

    if current == proxy {
        return Ok(());
    }

    debug!(canary = %name, "updating canary release proxy status");
    let cr_api: Api<CanaryRelease> = Api::namespaced(ctx.client.clone(), &namespace);
    let condition = new_condition(REASON_UPDATING, "");
    update_status_with_retries(&cr_api, &name, |cr| {
        let status = cr.status.get_or_insert_with(Default::default);
        status.proxy = proxy.clone();
        status.conditions.push(condition.clone());
    })
    .await
    .map_err(|err| {
        error!(canary = %name, error = %err, "error updating CanaryRelease status");
        ReconcileError::Kube(err)
    })?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "status_test.rs"]
mod tests;

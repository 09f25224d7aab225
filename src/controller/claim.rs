//! Controller-ref management for proxy deployments.
//!
//! Claiming follows the usual two-way contract: orphans whose labels match
//! the canary's selector are adopted (with a fresh quorum read guarding
//! against racing a parent deletion), and owned deployments whose labels no
//! longer match are released back.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{info, warn};

use crate::controller::canary::ReconcileError;
use crate::controller::Context;
use crate::crd::canary_release::{append_owner_if_missing, remove_owner_if_present};
use crate::crd::{canary_owner_reference, created_by_value, CanaryRelease, LABEL_CREATED_BY};

/// List deployments matching the canary's selector and claim them, returning
/// the claimed set sorted by name.
pub async fn claim_deployments(
    ctx: &Context,
    cr: &CanaryRelease,
) -> Result<Vec<Deployment>, ReconcileError> {
    let namespace = cr.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let name = cr.name_any();
    let selector_value = created_by_value(&namespace, &name);

    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let selector = format!("{}={}", LABEL_CREATED_BY, selector_value);
    let list = api.list(&ListParams::default().labels(&selector)).await?;

    let cr_uid = cr.uid().unwrap_or_default();
    let owner = canary_owner_reference(cr);
    let mut claimed = Vec::new();

    for dp in list {
        let matches = label_matches(&dp, &selector_value);
        match controller_of(&dp) {
            Some(existing) if existing.uid == cr_uid => {
                if matches {
                    claimed.push(dp);
                } else {
                    release_deployment(&api, &dp, &owner).await?;
                }
            }
            Some(_) => {
                // controlled by someone else, not ours to touch
            }
            None => {
                if !matches || cr.meta().deletion_timestamp.is_some() {
                    continue;
                }
                recheck_can_adopt(ctx, cr).await?;
                adopt_deployment(&api, &dp, &owner).await?;
                claimed.push(dp);
            }
        }
    }

    claimed.sort_by_key(|dp| dp.name_any());
    Ok(claimed)
}

fn label_matches(dp: &Deployment, selector_value: &str) -> bool {
    dp.labels()
        .get(LABEL_CREATED_BY)
        .map(|v| v == selector_value)
        .unwrap_or(false)
}

/// The controller owner reference of a deployment, if any.
pub fn controller_of(dp: &Deployment) -> Option<&OwnerReference> {
    dp.owner_references()
        .iter()
        .find(|o| o.controller == Some(true))
}

/// Re-fetch the CanaryRelease with a quorum read and refuse adoption if it
/// has been replaced or is being deleted. Guards the window between the
/// informer list and the ownership patch.
async fn recheck_can_adopt(ctx: &Context, cr: &CanaryRelease) -> Result<(), ReconcileError> {
    let namespace = cr.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let name = cr.name_any();
    let api: Api<CanaryRelease> = Api::namespaced(ctx.client.clone(), &namespace);

    let fresh = api.get(&name).await?;
    if fresh.uid() != cr.uid() {
        return Err(ReconcileError::CanaryGone(format!(
            "{}/{}: got uid {:?}, wanted {:?}",
            namespace,
            name,
            fresh.uid(),
            cr.uid()
        )));
    }
    if fresh.meta().deletion_timestamp.is_some() {
        return Err(ReconcileError::AdoptionRefused(format!(
            "{}/{} is being deleted",
            namespace, name
        )));
    }
    Ok(())
}

async fn adopt_deployment(
    api: &Api<Deployment>,
    dp: &Deployment,
    owner: &OwnerReference,
) -> Result<(), ReconcileError> {
    info!(deployment = %dp.name_any(), "adopting orphan proxy deployment");
    let owners = append_owner_if_missing(dp.owner_references().to_vec(), owner.clone());
    // the uid in the patch acts as a precondition against replacing a
    // recreated deployment
    let patch = json!({
        "metadata": {
            "uid": dp.uid(),
            "ownerReferences": owners,
        }
    });
    api.patch(
        &dp.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

async fn release_deployment(
    api: &Api<Deployment>,
    dp: &Deployment,
    owner: &OwnerReference,
) -> Result<(), ReconcileError> {
    warn!(deployment = %dp.name_any(), "releasing deployment that no longer matches");
    let owners = remove_owner_if_present(dp.owner_references().to_vec(), owner);
    let patch = json!({
        "metadata": {
            "uid": dp.uid(),
            "ownerReferences": owners,
        }
    });
    match api
        .patch(
            &dp.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
    {
        Ok(_) => Ok(()),
        // the deployment vanished while we were releasing it, nothing to do
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "claim_test.rs"]
mod tests;

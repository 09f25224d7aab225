//! Terminal transitions: adopt the canary into the release, or discard it.
//!
//! Original services are restored before anything is deleted. On adopt,
//! ownership of non-service resources moves to the Release before service
//! ownership, and both before any deletion; the garbage collector must not
//! cascade mid-transfer.

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::agent::reconcile::{patch_target_port, CANARY_SERVICE_SUFFIX, FORKED_SERVICE_SUFFIX};
use crate::agent::{deprecate, AgentContext, AgentError};
use crate::applier::gvk_of;
use crate::chart::replace_config;
use crate::crd::canary_release::remove_owner_if_present;
use crate::crd::{
    canary_owner_reference, new_condition, new_error_condition, release_controller_of,
    release_owner_reference, Application, CanaryRelease, CanaryTransition, Release,
};
use crate::render::{decode_object, split_manifest};
use crate::retry::add_condition;

/// How long adopt waits for the release controller to pick up the merged
/// config before transferring ownership anyway.
const VERSION_ADVANCE_TIMEOUT_SECS: u64 = 10;

/// Execute the transition the CR asks for, with condition bookkeeping.
pub async fn cleanup(cr: &CanaryRelease, ctx: &AgentContext) -> Result<Action, AgentError> {
    let api = ctx.cr_api();
    let name = cr.name_any();

    let result = do_cleanup(cr, ctx).await;
    let condition = match &result {
        Ok(()) => new_condition(&cr.spec.transition.to_string(), ""),
        Err(err) => new_error_condition(err),
    };
    let _ = add_condition(&api, &name, condition).await;

    result.map(|_| Action::await_change())
}

async fn do_cleanup(cr: &CanaryRelease, ctx: &AgentContext) -> Result<(), AgentError> {
    let phase = cr
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(CanaryTransition::None);
    if phase != CanaryTransition::None {
        // transition already finished
        return Ok(());
    }

    match cr.spec.transition {
        CanaryTransition::Adopted => {
            if !adopt(cr, ctx).await? {
                // adopt bailed out into a deprecation, finish on the next pass
                return Ok(());
            }
        }
        CanaryTransition::Deprecated => deprecate_cleanup(cr, ctx).await?,
        CanaryTransition::None => return Ok(()),
    }

    // the service-ownership swap above is authoritative; once it is done the
    // phase flips exactly once
    let patch = json!({"status": {"manifest": null, "phase": cr.spec.transition}});
    ctx.cr_api()
        .patch_status(
            &cr.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;

    *ctx.running_config.lock().await = None;
    ctx.exiting.store(true, Ordering::SeqCst);
    info!(transition = %cr.spec.transition, "canary transition complete");
    Ok(())
}

/// Adopt: the canary becomes the release.
///
/// Returns false when the release vanished or drifted and the canary was
/// deprecated instead.
async fn adopt(cr: &CanaryRelease, ctx: &AgentContext) -> Result<bool, AgentError> {
    let release = ctx.release_api().get_opt(&cr.spec.release).await?;
    let release = match release {
        Some(release) if !adoption_blocked(Some(&release), cr.spec.version) => release,
        _ => {
            info!("release gone or version drifted, deprecating instead of adopting");
            deprecate(ctx, cr).await?;
            return Ok(false);
        }
    };

    let svc_api: Api<Service> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let originals = collect_services(ctx, cr, "").await?;
    let canaries = collect_services(ctx, cr, CANARY_SERVICE_SUFFIX).await?;
    let forked = collect_services(ctx, cr, FORKED_SERVICE_SUFFIX).await?;

    // the canary pods become the real backends; the CR owner ref stays on
    // the originals until the explicit transfer below
    recover_services(&svc_api, &originals, &canaries, CANARY_SERVICE_SUFFIX, None).await?;

    // merge the canary config into the release (or its owning application)
    let canary_config = replace_config(&release.spec.config, &cr.spec.path, &cr.spec.config, None)?;
    match release_controller_of(&release) {
        None => {
            let mut updated = release.clone();
            updated.spec.config = canary_config;
            ctx.release_api()
                .replace(&updated.name_any(), &PostParams::default(), &updated)
                .await?;
        }
        Some(controller) => {
            let app_api: Api<Application> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
            let mut app = app_api.get(&controller.name).await?;
            if !set_vertex_config(&mut app, &release.name_any(), &canary_config) {
                warn!(application = %app.name_any(), "no graph vertex matches the release");
            }
            app_api
                .replace(&app.name_any(), &PostParams::default(), &app)
                .await?;
        }
    }

    wait_for_version_advance(ctx, &release).await;

    // ownership transfer: non-service manifest resources first, then the
    // original services, then deletions
    let owner_patch = release_owner_patch(&release);

    let manifest = cr
        .status
        .as_ref()
        .and_then(|s| s.manifest.as_deref())
        .unwrap_or_default();
    for obj in manifest_transfer_targets(manifest)? {
        let api = ctx.pool.api_for(&gvk_of(&obj)?, &ctx.namespace);
        api.patch(
            &obj.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&owner_patch),
        )
        .await?;
    }

    for svc in &originals {
        // the release controller reclaims the originals
        if let Err(err) = svc_api
            .patch(
                &svc.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&owner_patch),
            )
            .await
        {
            warn!(service = %svc.name_any(), error = %err, "error transferring service ownership");
        }
    }

    delete_services(&svc_api, &forked).await;
    delete_services(&svc_api, &canaries).await;

    Ok(true)
}

/// Deprecate: the stable release resumes all traffic.
async fn deprecate_cleanup(cr: &CanaryRelease, ctx: &AgentContext) -> Result<(), AgentError> {
    let svc_api: Api<Service> = Api::namespaced(ctx.client.clone(), &ctx.namespace);

    // the release may be gone entirely, in which case there is nothing to
    // restore
    let originals = collect_services(ctx, cr, "").await?;
    let forked = collect_services(ctx, cr, FORKED_SERVICE_SUFFIX).await?;

    let canary_owner = canary_owner_reference(cr);
    recover_services(
        &svc_api,
        &originals,
        &forked,
        FORKED_SERVICE_SUFFIX,
        Some(&canary_owner),
    )
    .await?;

    // canary-owned manifest resources go away with the manifest; failures
    // here are logged but do not block the phase flip, the ownership swap
    // above already restored service
    let manifest = cr
        .status
        .as_ref()
        .and_then(|s| s.manifest.as_deref())
        .unwrap_or_default();
    if let Err(err) = ctx
        .applier
        .delete(&ctx.namespace, &split_manifest(manifest))
        .await
    {
        error!(error = %err, "error deleting canary manifest");
    }

    delete_services(&svc_api, &forked).await;
    Ok(())
}

/// Fetch `<service><suffix>` for every targeted service, skipping missing
/// ones.
async fn collect_services(
    ctx: &AgentContext,
    cr: &CanaryRelease,
    suffix: &str,
) -> Result<Vec<Service>, AgentError> {
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let mut services = Vec::new();
    for svc in &cr.spec.service {
        let name = format!("{}{}", svc.service, suffix);
        if let Some(service) = api.get_opt(&name).await? {
            services.push(service);
        }
    }
    Ok(services)
}

/// Restore each original service's selector and target ports from its
/// `<name><suffix>` twin, optionally dropping the canary owner reference.
async fn recover_services(
    api: &Api<Service>,
    originals: &[Service],
    twins: &[Service],
    suffix: &str,
    remove_owner: Option<&OwnerReference>,
) -> Result<(), AgentError> {
    for original in originals {
        let twin_name = format!("{}{}", original.name_any(), suffix);
        let Some(twin) = twins.iter().find(|t| t.name_any() == twin_name) else {
            continue;
        };

        let restored = restore_service_from_twin(original, twin, remove_owner);
        info!(service = %restored.name_any(), "restoring original service");
        api.replace(&restored.name_any(), &PostParams::default(), &restored)
            .await?;
    }
    Ok(())
}

/// Restore one original service from a forked or canary twin: the twin's
/// selector and target ports move onto the original. The canary owner
/// reference is dropped only when `remove_owner` says so (deprecate);
/// adopt keeps it until the explicit transfer to the Release.
pub(crate) fn restore_service_from_twin(
    original: &Service,
    twin: &Service,
    remove_owner: Option<&OwnerReference>,
) -> Service {
    let mut restored = original.clone();
    if let Some(owner) = remove_owner {
        restored.metadata.owner_references = Some(remove_owner_if_present(
            restored.owner_references().to_vec(),
            owner,
        ));
    }

    let twin_spec = twin.spec.clone().unwrap_or_default();
    let spec = restored.spec.get_or_insert_with(Default::default);
    patch_target_port(
        spec.ports.get_or_insert_with(Default::default),
        &twin_spec.ports.unwrap_or_default(),
    );
    spec.selector = twin_spec.selector;
    restored
}

/// True when adopting is no longer possible and the canary falls back to a
/// deprecation: the release is gone, or its version drifted away from the
/// one the canary was authored against.
pub(crate) fn adoption_blocked(release: Option<&Release>, canary_version: i64) -> bool {
    match release {
        None => true,
        Some(release) => {
            release.status.as_ref().map(|s| s.version).unwrap_or(0) != canary_version
        }
    }
}

/// Manifest documents whose ownership moves to the Release on adopt, in
/// manifest order. Services are excluded: handing one to the release
/// controller ahead of the explicit swap would get it deleted as an
/// unexpected resource.
pub(crate) fn manifest_transfer_targets(
    manifest: &str,
) -> Result<Vec<DynamicObject>, AgentError> {
    let mut targets = Vec::new();
    for doc in split_manifest(manifest) {
        let obj = decode_object(&doc)?;
        if gvk_of(&obj)?.kind == "Service" {
            continue;
        }
        targets.push(obj);
    }
    Ok(targets)
}

/// The ownership patch applied on adopt: exactly one plain Release owner
/// reference (no controller flags), replacing whatever was there.
pub(crate) fn release_owner_patch(release: &Release) -> Value {
    json!({"metadata": {"ownerReferences": [release_owner_reference(release)]}})
}

/// Write the canary config into the application graph vertex matching the
/// release. Returns false when no vertex matches.
pub(crate) fn set_vertex_config(app: &mut Application, release_name: &str, config: &str) -> bool {
    for vertex in app.spec.graph.vertexes.iter_mut() {
        if vertex.name == release_name {
            vertex.spec.config = config.to_string();
            return true;
        }
    }
    false
}

/// Delete services with background propagation; missing ones are logged.
async fn delete_services(api: &Api<Service>, services: &[Service]) {
    for svc in services {
        match api.delete(&svc.name_any(), &DeleteParams::background()).await {
            Ok(_) => info!(service = %svc.name_any(), "deleted service"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                warn!(service = %svc.name_any(), "service already deleted");
            }
            Err(err) => {
                warn!(service = %svc.name_any(), error = %err, "error deleting service");
            }
        }
    }
}

/// Poll until the release controller advances past the adopted version,
/// bounded so a slow controller cannot wedge the transition.
async fn wait_for_version_advance(ctx: &AgentContext, release: &Release) {
    let old_version = release.status.as_ref().map(|s| s.version).unwrap_or(0);
    for _ in 0..VERSION_ADVANCE_TIMEOUT_SECS {
        match ctx.release_api().get_opt(&release.name_any()).await {
            Ok(Some(fresh)) => {
                let version = fresh.status.as_ref().map(|s| s.version).unwrap_or(0);
                if version > old_version {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "error polling release version");
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    warn!("release version did not advance in time, transferring ownership anyway");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "transition_test.rs"]
mod tests;

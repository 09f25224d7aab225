//! Steady-state sync: render both variants, fork services, point nginx at
//! the weighted upstreams, and steer the original services at the proxy.

use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::agent::{AgentContext, AgentError};
use crate::applier::UpdateOptions;
use crate::chart::replace_config;
use crate::crd::canary_release::append_owner_if_missing;
use crate::crd::{
    canary_owner_reference, created_by_value, new_condition, new_error_condition,
    release_owner_reference, CanaryProtocol, CanaryRelease, CanaryService, Release,
    LABEL_CREATED_BY, REASON_AVAILABLE, REASON_UPDATING,
};
use crate::nginx::config::{Endpoint, L4Backend, L4Protocol, L4Service, TemplateConfig};
use crate::render::{
    find_service, merge_manifest, normalize_doc, split_manifest, Carrier, RenderOptions,
};
use crate::retry::add_condition_if_new;

pub const FORKED_SERVICE_SUFFIX: &str = "-forked";
pub const CANARY_SERVICE_SUFFIX: &str = "-canary";

/// The first upstream port; one port is allocated per (protocol, port) pair.
pub const UPSTREAM_PORT_BASE: i32 = 8080;

/// The four views of one targeted service plus its upstream allocation.
pub struct ServiceCollection {
    /// original service name
    pub name: String,
    /// canary service config from the CR
    pub service: CanaryService,
    /// freshly rendered from the release config; the live copy may have been
    /// rewritten by a previous sync, so it is always re-derived
    pub origin: Service,
    /// live service in the cluster
    pub in_cluster: Service,
    /// origin copy renamed with the forked suffix
    pub forked: Service,
    /// canary rendering renamed with the canary suffix
    pub canary: Service,
    /// (protocol, service port) to allocated nginx upstream port
    pub upstream_ports: BTreeMap<(L4Protocol, i32), i32>,
}

/// Sync with condition bookkeeping: Updating on entry, then Available or a
/// Failure with the error.
pub async fn sync(
    cr: &CanaryRelease,
    release: &Release,
    ctx: &AgentContext,
) -> Result<(), AgentError> {
    let api = ctx.cr_api();
    let name = cr.name_any();

    // a steady-state resync (last condition Available) stays write-free
    let last_reason = cr
        .status
        .as_ref()
        .and_then(|s| s.conditions.last())
        .map(|c| c.reason.clone());
    if last_reason.as_deref() != Some(REASON_AVAILABLE) {
        add_condition_if_new(&api, &name, new_condition(REASON_UPDATING, "")).await?;
    }

    let result = do_sync(cr, release, ctx).await;
    let condition = match &result {
        Ok(()) => new_condition(REASON_AVAILABLE, ""),
        Err(err) => new_error_condition(err),
    };
    let _ = add_condition_if_new(&api, &name, condition).await;
    result
}

async fn do_sync(
    cr: &CanaryRelease,
    release: &Release,
    ctx: &AgentContext,
) -> Result<(), AgentError> {
    let canary_owner = canary_owner_reference(cr);
    let release_owner = release_owner_reference(release);

    // origin objects come from the release's rendered manifest
    let release_status = release.status.clone().unwrap_or_default();
    let origin_docs = Carrier::from_manifest(&release_status.manifest)
        .resources_of(&cr.spec.path)?
        .iter()
        .map(|doc| normalize_doc(doc))
        .collect::<Result<Vec<_>, _>>()?;

    // canary objects are re-rendered from the release template and the
    // patched config
    let canary_config = replace_config(&release.spec.config, &cr.spec.path, &cr.spec.config, None)?;
    let carrier = ctx
        .renderer
        .render(&RenderOptions {
            namespace: &ctx.namespace,
            release: &release.name_any(),
            version: release_status.version,
            template: &release.spec.template,
            config: &canary_config,
        })
        .await?;
    let mut canary_docs = carrier
        .resources_of(&cr.spec.path)?
        .iter()
        .map(|doc| normalize_doc(doc))
        .collect::<Result<Vec<_>, _>>()?;

    // forking rewrites the canary service documents in place, so the applied
    // manifest carries the renamed services
    let mut collections = build_collections(cr, ctx, &origin_docs, &mut canary_docs).await?;

    let last_manifest = split_manifest(
        cr.status
            .as_ref()
            .and_then(|s| s.manifest.as_deref())
            .unwrap_or_default(),
    );
    if last_manifest != canary_docs {
        ctx.applier
            .update(
                &ctx.namespace,
                &last_manifest,
                &canary_docs,
                &UpdateOptions {
                    owner_references: vec![canary_owner.clone(), release_owner.clone()],
                },
            )
            .await?;

        let patch = json!({"status": {"manifest": merge_manifest(&canary_docs)}});
        ctx.cr_api()
            .patch_status(
                &cr.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
    } else {
        debug!("canary manifest unchanged, skipping apply");
    }

    let mut config = TemplateConfig::default();
    let (tcp, udp) = allocate_upstreams(&ctx.namespace, &mut collections);
    config.tcp_backends = tcp;
    config.udp_backends = udp;

    {
        let running = ctx.running_config.lock().await;
        if let Some(running) = running.as_ref() {
            if running.same_backends(&config) {
                debug!("template config unchanged, skipping reload");
                return Ok(());
            }
        }
    }

    // forked services must exist before nginx resolves them as upstreams
    let svc_api: Api<Service> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    for col in &collections {
        let mut forked = col.forked.clone();
        forked.metadata.owner_references = Some(append_owner_if_missing(
            forked.owner_references().to_vec(),
            canary_owner.clone(),
        ));
        match svc_api.create(&PostParams::default(), &forked).await {
            Ok(_) => info!(service = %forked.name_any(), "created forked service"),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {}
            Err(err) => return Err(err.into()),
        }
    }

    // reload nginx before any traffic is steered at it
    match ctx.nginx.on_update(config.clone()).await {
        Ok(()) => ctx.metrics.record_nginx_reload("success"),
        Err(err) => {
            ctx.metrics.record_nginx_reload("error");
            return Err(err.into());
        }
    }

    // finally re-selector the original services onto the proxy pods
    let selector: BTreeMap<String, String> = [(
        LABEL_CREATED_BY.to_string(),
        created_by_value(&ctx.namespace, &ctx.canary_release),
    )]
    .into();

    for col in &collections {
        let desired_ports = rewrite_target_ports(&col.origin, &col.upstream_ports);

        let mut updated = col.in_cluster.clone();
        let spec = updated.spec.get_or_insert_with(Default::default);
        patch_target_port(spec.ports.get_or_insert_with(Default::default), &desired_ports);
        spec.selector = Some(selector.clone());

        let unchanged = updated.spec.as_ref().map(|s| (&s.ports, &s.selector))
            == col.in_cluster.spec.as_ref().map(|s| (&s.ports, &s.selector));
        if unchanged {
            continue;
        }

        updated.metadata.owner_references = Some(append_owner_if_missing(
            updated.owner_references().to_vec(),
            canary_owner.clone(),
        ));

        info!(service = %updated.name_any(), "steering original service at proxy");
        svc_api
            .replace(&updated.name_any(), &PostParams::default(), &updated)
            .await?;
    }

    *ctx.running_config.lock().await = Some(config);
    Ok(())
}

/// Build the four service views for every CanaryService entry, rewriting the
/// canary documents in place (rename + ClusterIP).
async fn build_collections(
    cr: &CanaryRelease,
    ctx: &AgentContext,
    origin_docs: &[String],
    canary_docs: &mut [String],
) -> Result<Vec<ServiceCollection>, AgentError> {
    let svc_api: Api<Service> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let mut collections = Vec::with_capacity(cr.spec.service.len());

    for svc in &cr.spec.service {
        let origin = find_service(origin_docs, &svc.service)?;

        let forked = fork_service(&origin, FORKED_SERVICE_SUFFIX);

        let in_cluster = svc_api
            .get_opt(&svc.service)
            .await?
            .ok_or_else(|| AgentError::ServiceMissing(svc.service.clone()))?;

        let canary = rewrite_canary_service(canary_docs, &svc.service)?;

        collections.push(ServiceCollection {
            name: svc.service.clone(),
            service: svc.clone(),
            origin,
            in_cluster,
            forked,
            canary,
            upstream_ports: BTreeMap::new(),
        });
    }

    Ok(collections)
}

/// A ClusterIP copy of `origin` renamed with `suffix`; NodePorts are cleared
/// to avoid allocation conflicts.
pub fn fork_service(origin: &Service, suffix: &str) -> Service {
    let mut copy = origin.clone();
    copy.metadata.name = Some(format!("{}{}", origin.name_any(), suffix));
    if let Some(spec) = copy.spec.as_mut() {
        if spec.type_.as_deref() == Some("NodePort") {
            for port in spec.ports.iter_mut().flatten() {
                port.node_port = None;
            }
        }
        spec.type_ = Some("ClusterIP".to_string());
        spec.cluster_ip = None;
        spec.cluster_ips = None;
    }
    copy
}

/// Find the canary service document, apply the fork rewrite to it in place,
/// and return the rewritten service.
fn rewrite_canary_service(
    canary_docs: &mut [String],
    name: &str,
) -> Result<Service, AgentError> {
    for doc in canary_docs.iter_mut() {
        let value: serde_json::Value = serde_yaml::from_str(doc).map_err(crate::render::RenderError::from)?;
        let kind = value.get("kind").and_then(serde_json::Value::as_str);
        let doc_name = value.pointer("/metadata/name").and_then(serde_json::Value::as_str);
        if kind != Some("Service") || doc_name != Some(name) {
            continue;
        }

        let service: Service =
            serde_json::from_value(value).map_err(crate::render::RenderError::from)?;
        let canary = fork_service(&service, CANARY_SERVICE_SUFFIX);

        let rewritten = serde_json::to_value(&canary).map_err(crate::render::RenderError::from)?;
        let yaml =
            serde_yaml::to_string(&rewritten).map_err(crate::render::RenderError::from)?;
        *doc = yaml.trim().to_string();
        return Ok(canary);
    }
    Err(crate::render::RenderError::ServiceNotFound(name.to_string()).into())
}

fn clamp_weight(weight: Option<i32>) -> (i32, i32) {
    let canary = weight.unwrap_or(0).clamp(0, 100);
    (canary, 100 - canary)
}

fn collapse_protocol(protocol: CanaryProtocol) -> L4Protocol {
    match protocol {
        CanaryProtocol::UDP => L4Protocol::UDP,
        // HTTP and HTTPS ride on TCP at L4
        _ => L4Protocol::TCP,
    }
}

/// Deterministic upstream allocation.
///
/// Collections are sorted by service name and each collection's ports by
/// port number; ports are then numbered sequentially from
/// [`UPSTREAM_PORT_BASE`]. The same inputs always produce the same
/// (protocol, port) → upstream mapping.
pub fn allocate_upstreams(
    namespace: &str,
    collections: &mut [ServiceCollection],
) -> (Vec<L4Service>, Vec<L4Service>) {
    collections.sort_by(|a, b| a.name.cmp(&b.name));

    let mut upstream_port = UPSTREAM_PORT_BASE;
    let mut tcp = Vec::new();
    let mut udp = Vec::new();

    for col in collections.iter_mut() {
        let mut ports = col.service.ports.clone();
        ports.sort_by_key(|p| p.port);

        for port in &ports {
            let protocol = collapse_protocol(port.protocol);
            let (canary_weight, origin_weight) = clamp_weight(port.config.weight);

            let upstream = L4Service {
                port: upstream_port,
                backend: L4Backend {
                    port: port.port,
                    name: col.name.clone(),
                    namespace: namespace.to_string(),
                    protocol,
                },
                endpoints: vec![
                    Endpoint {
                        address: col.forked.name_any(),
                        port: port.port,
                        weight: origin_weight,
                    },
                    Endpoint {
                        address: col.canary.name_any(),
                        port: port.port,
                        weight: canary_weight,
                    },
                ],
            };

            match protocol {
                L4Protocol::TCP => tcp.push(upstream),
                L4Protocol::UDP => udp.push(upstream),
            }

            col.upstream_ports.insert((protocol, port.port), upstream_port);
            upstream_port += 1;
        }
    }

    (tcp, udp)
}

/// Ports of the rendered origin with their target ports rewritten to the
/// allocated upstream ports. Ports without an allocation are left alone.
fn rewrite_target_ports(
    origin: &Service,
    upstream_ports: &BTreeMap<(L4Protocol, i32), i32>,
) -> Vec<ServicePort> {
    let mut ports = origin
        .spec
        .as_ref()
        .and_then(|s| s.ports.clone())
        .unwrap_or_default();

    for port in ports.iter_mut() {
        let protocol = match port.protocol.as_deref() {
            Some("UDP") => L4Protocol::UDP,
            _ => L4Protocol::TCP,
        };
        if let Some(upstream) = upstream_ports.get(&(protocol, port.port)) {
            port.target_port = Some(IntOrString::Int(*upstream));
        }
    }
    ports
}

/// Copy target ports from `patch` onto matching ports of `source`.
///
/// Ports match by name when both carry one, otherwise by (protocol, port).
pub fn patch_target_port(source: &mut [ServicePort], patch: &[ServicePort]) {
    for port in source.iter_mut() {
        if let Some(matching) = patch.iter().find(|p| is_same_port(port, p)) {
            port.target_port = matching.target_port.clone();
        }
    }
}

fn is_same_port(a: &ServicePort, b: &ServicePort) -> bool {
    match (a.name.as_deref(), b.name.as_deref()) {
        (Some(an), Some(bn)) if !an.is_empty() && !bn.is_empty() => an == bn,
        _ => {
            let ap = a.protocol.as_deref().unwrap_or("TCP");
            let bp = b.protocol.as_deref().unwrap_or("TCP");
            ap == bp && a.port == b.port
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "reconcile_test.rs"]
mod tests;

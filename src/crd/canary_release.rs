use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crd::condition::CanaryReleaseCondition;

/// API group shared by CanaryRelease and Release
pub const GROUP: &str = "peippo.io";
/// API version for all peippo.io resources
pub const VERSION: &str = "v1alpha1";

/// Label stamped on every resource created for a canary.
///
/// The value is `<namespace>.<name>` of the owning CanaryRelease, which is
/// why CanaryRelease names must not contain a dot (see [`split_namespace_name`]).
pub const LABEL_CREATED_BY: &str = "canary.peippo.io/created-by";

/// CanaryRelease declares traffic-splitting intent between a Release and a
/// modified variant of one of its sub-charts.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "peippo.io",
    version = "v1alpha1",
    kind = "CanaryRelease",
    plural = "canaryreleases",
    namespaced,
    status = "CanaryReleaseStatus",
    printcolumn = r#"{"name":"Release", "type":"string", "jsonPath":".spec.release"}"#,
    printcolumn = r#"{"name":"Version", "type":"integer", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Transition", "type":"string", "jsonPath":".spec.transition"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CanaryReleaseSpec {
    /// Name of the Release being canaried
    pub release: String,

    /// Release version this canary was authored against
    pub version: i64,

    /// Slash-separated locator of the sub-chart under canary
    pub path: String,

    /// Canary configuration override: a JSON document carrying a `_config`
    /// subtree, spliced into the release config at `path`
    #[serde(default)]
    pub config: String,

    /// Target services and their per-port weight overrides
    #[serde(default)]
    pub service: Vec<CanaryService>,

    /// User-driven terminal intent
    #[serde(default)]
    pub transition: CanaryTransition,

    /// Resource requests/limits for the proxy pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "any_object")]
    pub resources: Option<ResourceRequirements>,
}

fn any_object(_gen: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
    })
}

/// One targeted service and the weights for its ports
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CanaryService {
    /// Name of the service rendered by the release
    pub service: String,

    /// Ports to split; ports left out stay at 100% origin
    #[serde(default)]
    pub ports: Vec<CanaryPort>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CanaryPort {
    /// Service port number
    pub port: i32,

    /// Wire protocol; HTTP and HTTPS collapse to TCP for the L4 split
    #[serde(default)]
    pub protocol: CanaryProtocol,

    #[serde(default)]
    pub config: CanaryPortConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CanaryPortConfig {
    /// Canary weight in percent, clamped to [0, 100]; missing means 0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, JsonSchema,
)]
pub enum CanaryProtocol {
    HTTP,
    HTTPS,
    #[default]
    TCP,
    UDP,
}

/// Terminal intent (spec) and the controller's echo of it (status)
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum CanaryTransition {
    #[default]
    None,
    Adopted,
    Deprecated,
}

impl std::fmt::Display for CanaryTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CanaryTransition::None => write!(f, "None"),
            CanaryTransition::Adopted => write!(f, "Adopted"),
            CanaryTransition::Deprecated => write!(f, "Deprecated"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CanaryReleaseStatus {
    /// Echo of the transition; set exactly once, when cleanup completes
    #[serde(default)]
    pub phase: CanaryTransition,

    /// The canary manifest currently applied (used to diff the next sync and
    /// for precise cleanup); cleared on transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,

    /// Aggregated proxy workload state
    #[serde(default)]
    pub proxy: CanaryReleaseProxyStatus,

    /// Append-only event log
    #[serde(default)]
    pub conditions: Vec<CanaryReleaseCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CanaryReleaseProxyStatus {
    #[serde(default)]
    pub deployment: String,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub total_replicas: i32,
    #[serde(default)]
    pub pod_statuses: Vec<PodStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub restart_count: i32,
    #[serde(default)]
    pub ready_containers: i32,
    #[serde(default)]
    pub total_containers: i32,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum LabelError {
    #[error("unexpected created-by value: {0:?}")]
    Malformed(String),
}

/// Value of the created-by label for a CanaryRelease.
pub fn created_by_value(namespace: &str, name: &str) -> String {
    format!("{}.{}", namespace, name)
}

/// Split a created-by label value back into `(namespace, name)`.
///
/// The encoding joins the two with a dot, so a value with anything other
/// than exactly one dot is rejected.
pub fn split_namespace_name(value: &str) -> Result<(String, String), LabelError> {
    let parts: Vec<&str> = value.split('.').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(LabelError::Malformed(value.to_string()));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

/// Controller owner reference pointing at a CanaryRelease.
///
/// `blockOwnerDeletion` keeps the garbage collector from removing the CR
/// while children still reference it.
pub fn canary_owner_reference(cr: &CanaryRelease) -> OwnerReference {
    OwnerReference {
        api_version: CanaryRelease::api_version(&()).to_string(),
        kind: CanaryRelease::kind(&()).to_string(),
        name: cr.name_any(),
        uid: cr.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Append `pending` unless an owner with the same UID is already present.
pub fn append_owner_if_missing(
    mut owners: Vec<OwnerReference>,
    pending: OwnerReference,
) -> Vec<OwnerReference> {
    if !owners.iter().any(|o| o.uid == pending.uid) {
        owners.push(pending);
    }
    owners
}

/// Drop every owner whose UID matches `pending`.
pub fn remove_owner_if_present(
    owners: Vec<OwnerReference>,
    pending: &OwnerReference,
) -> Vec<OwnerReference> {
    owners.into_iter().filter(|o| o.uid != pending.uid).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "canary_release_test.rs"]
mod tests;

//! Typed views of the orchestrator's Release and Application resources.
//!
//! Both are owned by the release controller, not by this project; only the
//! fields the canary machinery reads or patches are modeled.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A declarative bundle (template + config) rendered by the orchestrator
/// into a set of cluster resources.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "peippo.io",
    version = "v1alpha1",
    kind = "Release",
    plural = "releases",
    namespaced,
    status = "ReleaseStatus"
)]
pub struct ReleaseSpec {
    /// Config tree as a JSON document
    #[serde(default)]
    pub config: String,

    /// Chart template payload handed to the renderer
    #[serde(default)]
    pub template: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ReleaseStatus {
    /// Monotonic version, advanced by the release controller on every
    /// config change
    #[serde(default)]
    pub version: i64,

    /// Rendered multi-document manifest for the current version
    #[serde(default)]
    pub manifest: String,
}

/// An orchestrator Application owning a graph of Releases.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "orchestration.peippo.io",
    version = "v1alpha1",
    kind = "Application",
    plural = "applications",
    namespaced
)]
pub struct ApplicationSpec {
    #[serde(default)]
    pub graph: ApplicationGraph,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ApplicationGraph {
    #[serde(default)]
    pub vertexes: Vec<GraphVertex>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct GraphVertex {
    pub name: String,
    #[serde(default)]
    pub spec: GraphVertexSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct GraphVertexSpec {
    #[serde(default)]
    pub config: String,
}

/// Plain (non-controller) owner reference pointing at a Release.
pub fn release_owner_reference(release: &Release) -> OwnerReference {
    OwnerReference {
        api_version: Release::api_version(&()).to_string(),
        kind: Release::kind(&()).to_string(),
        name: release.name_any(),
        uid: release.uid().unwrap_or_default(),
        ..Default::default()
    }
}

/// The Application controller reference of a Release, if it has one.
pub fn release_controller_of(release: &Release) -> Option<&OwnerReference> {
    release.owner_references().iter().find(|owner| {
        owner.api_version == Application::api_version(&()) && owner.kind == Application::kind(&())
    })
}

//! Dynamic-client manifest engine.
//!
//! The canary manifest contains arbitrary kinds, so creation, update and
//! deletion go through `Api<DynamicObject>` handles built per
//! (GroupVersionKind, namespace) by the [`ClientPool`].

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::crd::canary_release::append_owner_if_missing;
use crate::render::{decode_object, RenderError};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Decode(#[from] RenderError),

    #[error("manifest document has no kind")]
    MissingKind,

    #[error("manifest document has no name")]
    MissingName,
}

/// Builds dynamic API handles keyed by (GroupVersionKind, namespace).
#[derive(Clone)]
pub struct ClientPool {
    client: Client,
}

impl ClientPool {
    pub fn new(client: Client) -> Self {
        ClientPool { client }
    }

    pub fn api_for(&self, gvk: &GroupVersionKind, namespace: &str) -> Api<DynamicObject> {
        let ar = ApiResource::from_gvk(gvk);
        Api::namespaced_with(self.client.clone(), namespace, &ar)
    }
}

/// Extract the GroupVersionKind of a decoded manifest document.
pub fn gvk_of(obj: &DynamicObject) -> Result<GroupVersionKind, ApplyError> {
    let types = obj.types.as_ref().ok_or(ApplyError::MissingKind)?;
    Ok(gvk_from_type_meta(types))
}

fn gvk_from_type_meta(types: &TypeMeta) -> GroupVersionKind {
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    GroupVersionKind::gvk(group, version, &types.kind)
}

/// The create/update/delete sets between two manifests, keyed by
/// (apiVersion, kind, name).
#[derive(Default)]
pub struct ManifestDelta {
    pub creates: Vec<DynamicObject>,
    pub updates: Vec<DynamicObject>,
    pub deletes: Vec<DynamicObject>,
}

type DocKey = (String, String, String);

fn doc_key(obj: &DynamicObject) -> Result<DocKey, ApplyError> {
    let types = obj.types.as_ref().ok_or(ApplyError::MissingKind)?;
    let name = obj.metadata.name.clone().ok_or(ApplyError::MissingName)?;
    Ok((types.api_version.clone(), types.kind.clone(), name))
}

/// Diff two document lists into creates, updates and deletes.
pub fn diff_manifests(last: &[String], next: &[String]) -> Result<ManifestDelta, ApplyError> {
    let mut delta = ManifestDelta::default();

    let mut last_by_key: BTreeMap<DocKey, String> = BTreeMap::new();
    for doc in last {
        let obj = decode_object(doc)?;
        last_by_key.insert(doc_key(&obj)?, doc.clone());
    }

    for doc in next {
        let obj = decode_object(doc)?;
        match last_by_key.remove(&doc_key(&obj)?) {
            None => delta.creates.push(obj),
            Some(prev) if prev != *doc => delta.updates.push(obj),
            Some(_) => {}
        }
    }

    for doc in last_by_key.into_values() {
        delta.deletes.push(decode_object(&doc)?);
    }

    Ok(delta)
}

/// Applies manifest deltas through the pool.
#[derive(Clone)]
pub struct Applier {
    pool: ClientPool,
}

pub struct UpdateOptions {
    pub owner_references: Vec<OwnerReference>,
}

impl Applier {
    pub fn new(pool: ClientPool) -> Self {
        Applier { pool }
    }

    /// Drive the cluster from `last` to `next`: create new documents, update
    /// changed ones, delete documents that disappeared. All created and
    /// updated objects carry the given owner references.
    pub async fn update(
        &self,
        namespace: &str,
        last: &[String],
        next: &[String],
        opts: &UpdateOptions,
    ) -> Result<(), ApplyError> {
        let delta = diff_manifests(last, next)?;

        for mut obj in delta.creates {
            self.stamp_owners(&mut obj, opts);
            let api = self.pool.api_for(&gvk_of(&obj)?, namespace);
            match api.create(&PostParams::default(), &obj).await {
                Ok(_) => debug!(name = %obj.name_any(), "created manifest object"),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    // already exists, converge through a patch instead
                    api.patch(
                        &obj.name_any(),
                        &PatchParams::default(),
                        &Patch::Merge(&obj),
                    )
                    .await?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        for mut obj in delta.updates {
            self.stamp_owners(&mut obj, opts);
            let api = self.pool.api_for(&gvk_of(&obj)?, namespace);
            api.patch(
                &obj.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&obj),
            )
            .await?;
        }

        for obj in delta.deletes {
            let api = self.pool.api_for(&gvk_of(&obj)?, namespace);
            match api
                .delete(&obj.name_any(), &DeleteParams::background())
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    /// Delete every document of a manifest. Missing objects are ignored.
    pub async fn delete(&self, namespace: &str, docs: &[String]) -> Result<(), ApplyError> {
        for doc in docs {
            let obj = decode_object(doc)?;
            let api = self.pool.api_for(&gvk_of(&obj)?, namespace);
            match api
                .delete(&obj.name_any(), &DeleteParams::background())
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    warn!(name = %obj.name_any(), "manifest object already gone");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn stamp_owners(&self, obj: &mut DynamicObject, opts: &UpdateOptions) {
        let mut owners = obj.metadata.owner_references.take().unwrap_or_default();
        for owner in &opts.owner_references {
            owners = append_owner_if_missing(owners, owner.clone());
        }
        obj.metadata.owner_references = Some(owners);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "applier_test.rs"]
mod tests;

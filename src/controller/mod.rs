//! Cluster-wide CanaryRelease controller.
//!
//! Watches every CanaryRelease and keeps exactly one proxy Deployment per
//! active canary, aggregates proxy pod status, and tears everything down
//! when a canary finishes its transition.

pub mod canary;
pub mod claim;
pub mod status;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, PostParams};
use kube::runtime::reflector::ObjectRef;
use kube::{Client, CustomResourceExt, ResourceExt};
use tracing::{info, warn};

use crate::crd::{split_namespace_name, CanaryRelease, LABEL_CREATED_BY};
use crate::server::SharedMetrics;

pub use canary::{error_policy, reconcile, ReconcileError};

/// Shared state handed to every reconcile.
pub struct Context {
    pub client: Client,
    pub proxy_image: String,
    pub metrics: SharedMetrics,
}

impl Context {
    pub fn new(client: Client, proxy_image: String, metrics: SharedMetrics) -> Self {
        Context {
            client,
            proxy_image,
            metrics,
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used)] // Test helper - panicking is acceptable
    pub fn new_mock() -> Self {
        // a minimal config pointing nowhere; unit tests never issue requests
        let mut config = kube::Config::new("https://localhost:8080".parse().unwrap());
        config.default_namespace = "default".to_string();
        config.accept_invalid_certs = true;
        let client = Client::try_from(config).unwrap();

        Context {
            client,
            proxy_image: "registry.local/canary-proxy:test".to_string(),
            metrics: crate::server::create_metrics().unwrap(),
        }
    }
}

/// Create the CanaryRelease CRD, ignoring an already-existing one.
pub async fn ensure_crd(client: &Client) -> Result<(), kube::Error> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    match api.create(&PostParams::default(), &CanaryRelease::crd()).await {
        Ok(_) => {
            info!("created CustomResourceDefinition for CanaryRelease");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            info!("CustomResourceDefinition for CanaryRelease already exists");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Reverse-resolve a proxy pod to its owning CanaryRelease through the
/// created-by label. Pods without the label, or with a malformed value, are
/// dropped.
pub fn canary_release_for_pod(pod: &Pod) -> Option<ObjectRef<CanaryRelease>> {
    let value = pod.labels().get(LABEL_CREATED_BY)?;
    match split_namespace_name(value) {
        Ok((namespace, name)) => Some(ObjectRef::new(&name).within(&namespace)),
        Err(err) => {
            warn!(pod = %pod.name_any(), error = %err, "ignoring pod with malformed created-by label");
            None
        }
    }
}

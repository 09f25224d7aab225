use super::*;
use crate::crd::{CanaryReleaseSpec, CanaryReleaseStatus};
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

fn create_test_canary() -> CanaryRelease {
    let mut cr = CanaryRelease::new(
        "web",
        CanaryReleaseSpec {
            release: "shop".to_string(),
            version: 3,
            path: "shop/web".to_string(),
            config: String::new(),
            service: vec![],
            transition: CanaryTransition::None,
            resources: Some(ResourceRequirements {
                limits: Some([("cpu".to_string(), Quantity("100m".to_string()))].into()),
                ..Default::default()
            }),
        },
    );
    cr.metadata.namespace = Some("default".to_string());
    cr.metadata.uid = Some("uid-1".to_string());
    cr
}

#[test]
fn test_generate_deployment_shape() {
    let cr = create_test_canary();
    let deploy = generate_deployment(&cr, "registry.local/canary-proxy:v1");

    assert_eq!(deploy.metadata.name.as_deref(), Some("web-proxy"));
    assert_eq!(deploy.metadata.namespace.as_deref(), Some("default"));
    assert_eq!(
        deploy
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_CREATED_BY))
            .map(String::as_str),
        Some("default.web")
    );

    let spec = deploy.spec.as_ref().unwrap();
    assert_eq!(spec.replicas, Some(1));

    let pod_spec = spec.template.spec.as_ref().unwrap();
    assert_eq!(pod_spec.termination_grace_period_seconds, Some(60));

    let container = &pod_spec.containers[0];
    assert_eq!(container.image.as_deref(), Some("registry.local/canary-proxy:v1"));
    assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
    assert_eq!(container.resources, cr.spec.resources);

    let env = container.env.as_ref().unwrap();
    let lookup = |name: &str| {
        env.iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.clone())
    };
    assert_eq!(lookup("CANARY_RELEASE_NAME"), Some("web".to_string()));
    assert_eq!(
        lookup("CANARY_RELEASE_NAMESPACE"),
        Some("default".to_string())
    );
    assert_eq!(lookup("RELEASE_NAME"), Some("shop".to_string()));
}

#[test]
fn test_generate_deployment_is_controller_owned() {
    let cr = create_test_canary();
    let deploy = generate_deployment(&cr, "img");

    let owners = deploy.metadata.owner_references.as_ref().unwrap();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].kind, "CanaryRelease");
    assert_eq!(owners[0].name, "web");
    assert_eq!(owners[0].uid, "uid-1");
    assert_eq!(owners[0].controller, Some(true));
    assert_eq!(owners[0].block_owner_deletion, Some(true));
}

#[test]
fn test_generate_deployment_selector_matches_pod_labels() {
    let cr = create_test_canary();
    let deploy = generate_deployment(&cr, "img");

    let spec = deploy.spec.as_ref().unwrap();
    let pod_labels = spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone());
    assert_eq!(spec.selector.match_labels, pod_labels);
}

#[test]
fn test_phase_of_defaults_to_none() {
    let cr = create_test_canary();
    assert_eq!(phase_of(&cr), CanaryTransition::None);
}

#[test]
fn test_phase_of_reads_status() {
    let mut cr = create_test_canary();
    cr.status = Some(CanaryReleaseStatus {
        phase: CanaryTransition::Adopted,
        ..Default::default()
    });
    assert_eq!(phase_of(&cr), CanaryTransition::Adopted);
}

#[tokio::test]
async fn test_error_policy_requeues_and_counts() {
    let cr = Arc::new(create_test_canary());
    let error = ReconcileError::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "test error".to_string(),
        reason: "InternalError".to_string(),
        code: 500,
    }));
    let ctx = Arc::new(Context::new_mock());

    let action = error_policy(cr, &error, ctx.clone());

    assert_eq!(action, Action::requeue(Duration::from_secs(10)));
    assert_eq!(
        ctx.metrics
            .reconciliations_total
            .with_label_values(&["canary", "error"])
            .get(),
        1
    );
}

#[test]
fn test_proxy_name_prefix_selection() {
    // the pruning rule in sync(): keep only names with the canonical prefix
    let prefix = format!("{}{}", "web", PROXY_NAME_SUFFIX);
    assert!("web-proxy".starts_with(&prefix));
    assert!("web-proxy-6b4f9".starts_with(&prefix));
    assert!(!"other-proxy".starts_with(&prefix));
    assert!(!"web".starts_with(&prefix));
}

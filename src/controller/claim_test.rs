use super::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;

fn deployment(name: &str, owners: Vec<OwnerReference>) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            owner_references: Some(owners),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn owner(uid: &str, controller: bool) -> OwnerReference {
    OwnerReference {
        api_version: "peippo.io/v1alpha1".to_string(),
        kind: "CanaryRelease".to_string(),
        name: "web".to_string(),
        uid: uid.to_string(),
        controller: controller.then_some(true),
        block_owner_deletion: None,
    }
}

#[test]
fn test_controller_of_finds_controller_ref() {
    let dp = deployment("web-proxy", vec![owner("uid-a", false), owner("uid-b", true)]);
    let found = controller_of(&dp).unwrap();
    assert_eq!(found.uid, "uid-b");
}

#[test]
fn test_controller_of_ignores_plain_owners() {
    let dp = deployment("web-proxy", vec![owner("uid-a", false)]);
    assert!(controller_of(&dp).is_none());
}

#[test]
fn test_controller_of_none_for_orphan() {
    let dp = deployment("web-proxy", vec![]);
    assert!(controller_of(&dp).is_none());
}

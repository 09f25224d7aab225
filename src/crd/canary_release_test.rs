use super::*;
use crate::crd::condition::*;
use kube::api::ObjectMeta;

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
            resources: None,
        },
    );
    cr.metadata = ObjectMeta {
        name: Some("web".to_string()),
        namespace: Some("default".to_string()),
        uid: Some("uid-1".to_string()),
        ..Default::default()
    };
    cr
}

#[test]
fn test_created_by_value_joins_with_dot() {
    assert_eq!(created_by_value("default", "web"), "default.web");
}

#[test]
fn test_split_namespace_name_round_trips() {
    let (namespace, name) = split_namespace_name("default.web").unwrap();
    assert_eq!(namespace, "default");
    assert_eq!(name, "web");
}

#[test]
fn test_split_namespace_name_rejects_missing_dot() {
    assert!(split_namespace_name("defaultweb").is_err());
}

#[test]
fn test_split_namespace_name_rejects_extra_dots() {
    assert!(split_namespace_name("default.web.extra").is_err());
}

#[test]
fn test_split_namespace_name_rejects_empty_parts() {
    assert!(split_namespace_name(".web").is_err());
    assert!(split_namespace_name("default.").is_err());
}

#[test]
fn test_canary_owner_reference_is_controller() {
    let cr = create_test_canary();
    let owner = canary_owner_reference(&cr);

    assert_eq!(owner.api_version, "peippo.io/v1alpha1");
    assert_eq!(owner.kind, "CanaryRelease");
    assert_eq!(owner.name, "web");
    assert_eq!(owner.uid, "uid-1");
    assert_eq!(owner.controller, Some(true));
    assert_eq!(owner.block_owner_deletion, Some(true));
}

#[test]
fn test_append_owner_if_missing_deduplicates_by_uid() {
    let cr = create_test_canary();
    let owner = canary_owner_reference(&cr);

    let owners = append_owner_if_missing(vec![], owner.clone());
    assert_eq!(owners.len(), 1);

    let owners = append_owner_if_missing(owners, owner);
    assert_eq!(owners.len(), 1);
}

#[test]
fn test_remove_owner_if_present_filters_by_uid() {
    let cr = create_test_canary();
    let owner = canary_owner_reference(&cr);

    let other = OwnerReference {
        uid: "uid-2".to_string(),
        ..owner.clone()
    };

    let owners = vec![owner.clone(), other.clone()];
    let remaining = remove_owner_if_present(owners, &owner);
    assert_eq!(remaining, vec![other]);
}

#[test]
fn test_transition_defaults_to_none() {
    let cr = create_test_canary();
    assert_eq!(cr.spec.transition, CanaryTransition::None);
}

#[test]
fn test_transition_serializes_as_plain_strings() {
    assert_eq!(
        serde_json::to_string(&CanaryTransition::Adopted).unwrap(),
        r#""Adopted""#
    );
    assert_eq!(
        serde_json::to_string(&CanaryTransition::Deprecated).unwrap(),
        r#""Deprecated""#
    );
    assert_eq!(
        serde_json::to_string(&CanaryTransition::None).unwrap(),
        r#""None""#
    );
}

#[test]
fn test_spec_deserializes_with_defaults() {
    let cr: CanaryReleaseSpec = serde_json::from_str(
        r#"{"release": "shop", "version": 1, "path": "shop/web"}"#,
    )
    .unwrap();

    assert_eq!(cr.transition, CanaryTransition::None);
    assert!(cr.service.is_empty());
    assert!(cr.config.is_empty());
    assert!(cr.resources.is_none());
}

#[test]
fn test_condition_reason_maps_to_type() {
    assert_eq!(
        new_condition(REASON_AVAILABLE, "").type_,
        CanaryReleaseConditionType::Available
    );
    assert_eq!(
        new_condition(REASON_CREATING, "").type_,
        CanaryReleaseConditionType::Progressing
    );
    assert_eq!(
        new_condition(REASON_UPDATING, "").type_,
        CanaryReleaseConditionType::Progressing
    );
    assert_eq!(
        new_condition(REASON_ADOPTED, "").type_,
        CanaryReleaseConditionType::Archived
    );
    assert_eq!(
        new_condition(REASON_DEPRECATED, "").type_,
        CanaryReleaseConditionType::Archived
    );
    assert_eq!(
        new_condition(REASON_ERROR, "boom").type_,
        CanaryReleaseConditionType::Failure
    );
}

#[test]
fn test_error_condition_carries_message() {
    let condition = new_error_condition(&"render failed");
    assert_eq!(condition.reason, "Error");
    assert_eq!(condition.message, "render failed");
    assert_eq!(condition.status, "True");
}

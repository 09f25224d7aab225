use super::*;

fn doc(kind: &str, name: &str, extra: &str) -> String {
    let api_version = match kind {
        "Deployment" => "apps/v1",
        _ => "v1",
    };
    format!(
        "apiVersion: {}\nkind: {}\nmetadata:\n  name: {}\n{}",
        api_version, kind, name, extra
    )
}

#[test]
fn test_diff_manifests_all_new() {
    let next = vec![doc("Service", "api", ""), doc("Deployment", "api", "")];
    let delta = diff_manifests(&[], &next).unwrap();

    assert_eq!(delta.creates.len(), 2);
    assert!(delta.updates.is_empty());
    assert!(delta.deletes.is_empty());
}

#[test]
fn test_diff_manifests_unchanged() {
    let docs = vec![doc("Service", "api", "")];
    let delta = diff_manifests(&docs, &docs).unwrap();

    assert!(delta.creates.is_empty());
    assert!(delta.updates.is_empty());
    assert!(delta.deletes.is_empty());
}

#[test]
fn test_diff_manifests_update_on_content_change() {
    let last = vec![doc("Deployment", "api", "spec:\n  replicas: 1\n")];
    let next = vec![doc("Deployment", "api", "spec:\n  replicas: 2\n")];
    let delta = diff_manifests(&last, &next).unwrap();

    assert!(delta.creates.is_empty());
    assert_eq!(delta.updates.len(), 1);
    assert!(delta.deletes.is_empty());
}

#[test]
fn test_diff_manifests_delete_on_removal() {
    let last = vec![doc("Service", "api", ""), doc("Service", "db", "")];
    let next = vec![doc("Service", "api", "")];
    let delta = diff_manifests(&last, &next).unwrap();

    assert!(delta.creates.is_empty());
    assert!(delta.updates.is_empty());
    assert_eq!(delta.deletes.len(), 1);
    assert_eq!(delta.deletes[0].metadata.name.as_deref(), Some("db"));
}

#[test]
fn test_diff_manifests_same_name_different_kind() {
    // a Service and a Deployment may share a name; they are distinct keys
    let last = vec![doc("Service", "api", "")];
    let next = vec![doc("Deployment", "api", "")];
    let delta = diff_manifests(&last, &next).unwrap();

    assert_eq!(delta.creates.len(), 1);
    assert_eq!(delta.deletes.len(), 1);
}

#[test]
fn test_diff_manifests_rejects_nameless_docs() {
    let bad = vec!["apiVersion: v1\nkind: Service\nmetadata: {}\n".to_string()];
    assert!(matches!(
        diff_manifests(&bad, &[]),
        Err(ApplyError::MissingName)
    ));
}

#[test]
fn test_gvk_of_core_group() {
    let obj = crate::render::decode_object(&doc("Service", "api", "")).unwrap();
    let gvk = gvk_of(&obj).unwrap();
    assert_eq!(gvk.group, "");
    assert_eq!(gvk.version, "v1");
    assert_eq!(gvk.kind, "Service");
}

#[test]
fn test_gvk_of_named_group() {
    let obj = crate::render::decode_object(&doc("Deployment", "api", "")).unwrap();
    let gvk = gvk_of(&obj).unwrap();
    assert_eq!(gvk.group, "apps");
    assert_eq!(gvk.version, "v1");
    assert_eq!(gvk.kind, "Deployment");
}

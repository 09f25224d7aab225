use super::*;

const MANIFEST: &str = r#"---
# Source: shop/web
apiVersion: v1
kind: Service
metadata:
  name: api
spec:
  type: ClusterIP
  ports:
    - port: 80
      protocol: TCP
      targetPort: 80
---
# Source: shop/web
apiVersion: apps/v1
kind: Deployment
metadata:
  name: api
spec:
  replicas: 2
---
# Source: shop/db
apiVersion: v1
kind: Service
metadata:
  name: db
"#;

#[test]
fn test_split_manifest_drops_empty_documents() {
    let docs = split_manifest("---\nfoo: 1\n---\n\n---\nbar: 2\n");
    assert_eq!(docs, vec!["foo: 1", "bar: 2"]);
}

#[test]
fn test_merge_manifest_round_trips() {
    let docs = vec!["foo: 1".to_string(), "bar: 2".to_string()];
    let merged = merge_manifest(&docs);
    assert_eq!(split_manifest(&merged), docs);
}

#[test]
fn test_carrier_selects_resources_by_path() {
    let carrier = Carrier::from_manifest(MANIFEST);

    let web = carrier.resources_of("shop/web").unwrap();
    assert_eq!(web.len(), 2);
    assert!(web[0].contains("kind: Service"));
    assert!(web[1].contains("kind: Deployment"));

    let db = carrier.resources_of("shop/db").unwrap();
    assert_eq!(db.len(), 1);
}

#[test]
fn test_carrier_selects_subtree() {
    // a parent path picks up everything below it
    let carrier = Carrier::from_manifest(MANIFEST);
    assert!(carrier.resources_of("shop").is_err()); // root path only matches unannotated docs

    let carrier = Carrier::from_manifest(
        "# Source: shop/web/assets\nkind: ConfigMap\nmetadata:\n  name: assets\n",
    );
    let docs = carrier.resources_of("shop/web").unwrap();
    assert_eq!(docs.len(), 1);
}

#[test]
fn test_carrier_errors_on_unknown_path() {
    let carrier = Carrier::from_manifest(MANIFEST);
    assert!(matches!(
        carrier.resources_of("shop/missing"),
        Err(RenderError::PathNotFound(_))
    ));
}

#[test]
fn test_find_service_by_name() {
    let docs = split_manifest(MANIFEST);
    let svc = find_service(&docs, "api").unwrap();
    assert_eq!(svc.metadata.name.as_deref(), Some("api"));
    let ports = svc.spec.unwrap().ports.unwrap();
    assert_eq!(ports[0].port, 80);
}

#[test]
fn test_find_service_skips_other_kinds() {
    // a Deployment named "api" exists too; only the Service matches
    let docs = split_manifest(MANIFEST);
    let err = find_service(&docs, "missing").unwrap_err();
    assert!(matches!(err, RenderError::ServiceNotFound(_)));
}

#[test]
fn test_normalize_doc_strips_comments() {
    let doc = "# Source: shop/web\nfoo: 1\n";
    let normalized = normalize_doc(doc).unwrap();
    assert_eq!(normalized, "foo: 1");
}

#[test]
fn test_decode_object_reads_type_meta() {
    let obj = decode_object("apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: api\n")
        .unwrap();
    let types = obj.types.unwrap();
    assert_eq!(types.api_version, "apps/v1");
    assert_eq!(types.kind, "Deployment");
}

#[tokio::test]
async fn test_tera_renderer_renders_config_values() {
    let template = r#"---
# Source: {{ release }}/web
apiVersion: v1
kind: Service
metadata:
  name: {{ config.web._config.name }}
  namespace: {{ namespace }}
  labels:
    version: "{{ version }}"
"#;

    let carrier = TeraRenderer
        .render(&RenderOptions {
            namespace: "default",
            release: "shop",
            version: 4,
            template,
            config: r#"{"web": {"_config": {"name": "api"}}}"#,
        })
        .await
        .unwrap();

    let docs = carrier.resources_of("shop/web").unwrap();
    assert_eq!(docs.len(), 1);
    assert!(docs[0].contains("name: api"));
    assert!(docs[0].contains("namespace: default"));
    assert!(docs[0].contains(r#"version: "4""#));
}

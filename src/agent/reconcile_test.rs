use super::*;
use crate::crd::{CanaryPort, CanaryPortConfig};
use k8s_openapi::api::core::v1::ServiceSpec;
use kube::api::ObjectMeta;

fn service(name: &str, ports: Vec<ServicePort>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some([("app".to_string(), name.to_string())].into()),
            ports: Some(ports),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

fn tcp_port(port: i32) -> ServicePort {
    ServicePort {
        port,
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

fn collection(name: &str, ports: Vec<CanaryPort>) -> ServiceCollection {
    let origin = service(name, vec![tcp_port(80)]);
    ServiceCollection {
        name: name.to_string(),
        service: CanaryService {
            service: name.to_string(),
            ports,
        },
        forked: fork_service(&origin, FORKED_SERVICE_SUFFIX),
        canary: fork_service(&origin, CANARY_SERVICE_SUFFIX),
        in_cluster: origin.clone(),
        origin,
        upstream_ports: BTreeMap::new(),
    }
}

fn weighted_port(port: i32, protocol: CanaryProtocol, weight: Option<i32>) -> CanaryPort {
    CanaryPort {
        port,
        protocol,
        config: CanaryPortConfig { weight },
    }
}

#[test]
fn test_fork_service_renames_and_forces_cluster_ip() {
    let mut origin = service("api", vec![tcp_port(80)]);
    if let Some(spec) = origin.spec.as_mut() {
        spec.type_ = Some("NodePort".to_string());
        if let Some(ports) = spec.ports.as_mut() {
            ports[0].node_port = Some(30080);
        }
    }

    let forked = fork_service(&origin, FORKED_SERVICE_SUFFIX);

    assert_eq!(forked.metadata.name.as_deref(), Some("api-forked"));
    let spec = forked.spec.unwrap();
    assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
    assert_eq!(spec.ports.unwrap()[0].node_port, None);
    // the original is untouched
    assert_eq!(origin.metadata.name.as_deref(), Some("api"));
}

#[test]
fn test_allocate_upstreams_starts_at_base_port() {
    let mut cols = vec![collection(
        "api",
        vec![weighted_port(80, CanaryProtocol::TCP, Some(25))],
    )];

    let (tcp, udp) = allocate_upstreams("default", &mut cols);

    assert!(udp.is_empty());
    assert_eq!(tcp.len(), 1);
    assert_eq!(tcp[0].port, UPSTREAM_PORT_BASE);
    assert_eq!(tcp[0].backend.name, "api");
    assert_eq!(tcp[0].backend.namespace, "default");
    assert_eq!(
        tcp[0].endpoints,
        vec![
            Endpoint {
                address: "api-forked".to_string(),
                port: 80,
                weight: 75,
            },
            Endpoint {
                address: "api-canary".to_string(),
                port: 80,
                weight: 25,
            },
        ]
    );
    assert_eq!(
        cols[0].upstream_ports.get(&(L4Protocol::TCP, 80)),
        Some(&UPSTREAM_PORT_BASE)
    );
}

#[test]
fn test_allocate_upstreams_is_deterministic() {
    let build = || {
        vec![
            collection(
                "zeta",
                vec![
                    weighted_port(90, CanaryProtocol::TCP, Some(10)),
                    weighted_port(53, CanaryProtocol::UDP, Some(50)),
                ],
            ),
            collection("api", vec![weighted_port(80, CanaryProtocol::HTTP, None)]),
        ]
    };

    let mut first = build();
    let mut second = build();
    // same inputs in a different order
    second.reverse();

    let (tcp1, udp1) = allocate_upstreams("default", &mut first);
    let (tcp2, udp2) = allocate_upstreams("default", &mut second);

    assert_eq!(tcp1, tcp2);
    assert_eq!(udp1, udp2);
    assert_eq!(
        first.iter().map(|c| c.upstream_ports.clone()).collect::<Vec<_>>(),
        second.iter().map(|c| c.upstream_ports.clone()).collect::<Vec<_>>()
    );

    // sorted by service name, then port: api:80 → 8080, zeta:53 → 8081, zeta:90 → 8082
    assert_eq!(
        first[0].upstream_ports.get(&(L4Protocol::TCP, 80)),
        Some(&8080)
    );
    assert_eq!(
        first[1].upstream_ports.get(&(L4Protocol::UDP, 53)),
        Some(&8081)
    );
    assert_eq!(
        first[1].upstream_ports.get(&(L4Protocol::TCP, 90)),
        Some(&8082)
    );
}

#[test]
fn test_allocate_upstreams_collapses_http_to_tcp() {
    let mut cols = vec![collection(
        "api",
        vec![
            weighted_port(80, CanaryProtocol::HTTP, Some(10)),
            weighted_port(443, CanaryProtocol::HTTPS, Some(10)),
            weighted_port(53, CanaryProtocol::UDP, Some(10)),
        ],
    )];

    let (tcp, udp) = allocate_upstreams("default", &mut cols);

    assert_eq!(tcp.len(), 2);
    assert_eq!(udp.len(), 1);
    assert!(tcp.iter().all(|s| s.backend.protocol == L4Protocol::TCP));
    assert_eq!(udp[0].backend.protocol, L4Protocol::UDP);
}

#[test]
fn test_allocate_upstreams_clamps_weights() {
    let mut cols = vec![collection(
        "api",
        vec![
            weighted_port(80, CanaryProtocol::TCP, Some(150)),
            weighted_port(81, CanaryProtocol::TCP, Some(-5)),
            weighted_port(82, CanaryProtocol::TCP, None),
        ],
    )];

    let (tcp, _) = allocate_upstreams("default", &mut cols);

    // (origin, canary) per port
    assert_eq!(tcp[0].endpoints[0].weight, 0);
    assert_eq!(tcp[0].endpoints[1].weight, 100);
    assert_eq!(tcp[1].endpoints[0].weight, 100);
    assert_eq!(tcp[1].endpoints[1].weight, 0);
    assert_eq!(tcp[2].endpoints[0].weight, 100);
    assert_eq!(tcp[2].endpoints[1].weight, 0);
}

#[test]
fn test_patch_target_port_matches_by_name() {
    let mut source = vec![ServicePort {
        name: Some("http".to_string()),
        port: 80,
        target_port: Some(IntOrString::Int(8080)),
        ..Default::default()
    }];
    let patch = vec![ServicePort {
        name: Some("http".to_string()),
        port: 9999,
        target_port: Some(IntOrString::String("web".to_string())),
        ..Default::default()
    }];

    patch_target_port(&mut source, &patch);
    assert_eq!(
        source[0].target_port,
        Some(IntOrString::String("web".to_string()))
    );
}

#[test]
fn test_patch_target_port_matches_by_protocol_and_port() {
    let mut source = vec![
        ServicePort {
            port: 80,
            protocol: Some("TCP".to_string()),
            target_port: Some(IntOrString::Int(8080)),
            ..Default::default()
        },
        ServicePort {
            port: 53,
            protocol: Some("UDP".to_string()),
            target_port: Some(IntOrString::Int(8081)),
            ..Default::default()
        },
    ];
    let patch = vec![ServicePort {
        port: 80,
        // protocol defaults to TCP when unset
        protocol: None,
        target_port: Some(IntOrString::Int(80)),
        ..Default::default()
    }];

    patch_target_port(&mut source, &patch);
    assert_eq!(source[0].target_port, Some(IntOrString::Int(80)));
    // the UDP port is left alone
    assert_eq!(source[1].target_port, Some(IntOrString::Int(8081)));
}

use super::*;

fn l4(port: i32, endpoints: Vec<(&str, i32)>) -> L4Service {
    L4Service {
        port,
        backend: L4Backend {
            port: 80,
            name: "api".to_string(),
            namespace: "default".to_string(),
            protocol: L4Protocol::TCP,
        },
        endpoints: endpoints
            .into_iter()
            .map(|(address, weight)| Endpoint {
                address: address.to_string(),
                port: 80,
                weight,
            })
            .collect(),
    }
}

#[test]
fn test_l4_service_same_as_ignores_endpoint_order() {
    let a = l4(8080, vec![("api-forked", 75), ("api-canary", 25)]);
    let b = l4(8080, vec![("api-canary", 25), ("api-forked", 75)]);
    assert!(a.same_as(&b));
}

#[test]
fn test_l4_service_same_as_detects_weight_change() {
    let a = l4(8080, vec![("api-forked", 75), ("api-canary", 25)]);
    let b = l4(8080, vec![("api-forked", 50), ("api-canary", 50)]);
    assert!(!a.same_as(&b));
}

#[test]
fn test_l4_service_same_as_detects_port_change() {
    let a = l4(8080, vec![("api-forked", 75)]);
    let b = l4(8081, vec![("api-forked", 75)]);
    assert!(!a.same_as(&b));
}

#[test]
fn test_template_config_same_backends() {
    let mut a = TemplateConfig::default();
    a.tcp_backends = vec![
        l4(8080, vec![("api-forked", 75), ("api-canary", 25)]),
        l4(8081, vec![("db-forked", 100), ("db-canary", 0)]),
    ];

    let mut b = TemplateConfig::default();
    b.tcp_backends = vec![
        l4(8081, vec![("db-canary", 0), ("db-forked", 100)]),
        l4(8080, vec![("api-canary", 25), ("api-forked", 75)]),
    ];

    assert!(a.same_backends(&b));

    // tunables do not participate
    b.max_open_files = 4096;
    assert!(a.same_backends(&b));

    b.udp_backends = vec![l4(9000, vec![("dns-forked", 100)])];
    assert!(!a.same_backends(&b));
}

#[test]
fn test_template_config_same_backends_length_mismatch() {
    let mut a = TemplateConfig::default();
    a.tcp_backends = vec![l4(8080, vec![("api-forked", 100)])];
    let b = TemplateConfig::default();
    assert!(!a.same_backends(&b));
}

#[test]
fn test_nginx_settings_defaults() {
    let settings = NginxSettings::default();
    assert_eq!(settings.worker_processes, "auto");
    assert!(!settings.enable_vts_status);
}

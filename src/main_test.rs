use clap::Parser;

use crate::Options;

#[test]
fn test_options_default_proxy_image() {
    let opts = Options::try_parse_from(["peippo"]).unwrap();
    assert_eq!(opts.proxy_image, crate::DEFAULT_PROXY_IMAGE);
    assert!(opts.kubeconfig.is_none());
    assert!(!opts.debug);
}

#[test]
fn test_options_flag_overrides() {
    let opts = Options::try_parse_from([
        "peippo",
        "--kubeconfig",
        "/tmp/kubeconfig",
        "--proxy-image",
        "registry.local/proxy:v2",
        "--debug",
        "--log-force-color",
    ])
    .unwrap();

    assert_eq!(
        opts.kubeconfig.as_deref(),
        Some(std::path::Path::new("/tmp/kubeconfig"))
    );
    assert_eq!(opts.proxy_image, "registry.local/proxy:v2");
    assert!(opts.debug);
    assert!(opts.log_force_color);
}

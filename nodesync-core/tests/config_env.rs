//! Environment variables override file configuration

use std::io::Write;

use nodesync_core::bootstrap::load_config;

#[test]
fn env_overrides_file_values() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(file, "cluster:\n  kubeconfig: /from/file\ntargets:\n  port: 9200").unwrap();
    let path = file.path().to_str().unwrap().to_string();

    std::env::set_var("NODESYNC__CLUSTER__KUBECONFIG", "/from/env");
    std::env::set_var("NODESYNC__TARGETS__REMOVAL_GRACE_SECS", "30");
    let config = load_config(Some(&path));
    std::env::remove_var("NODESYNC__CLUSTER__KUBECONFIG");
    std::env::remove_var("NODESYNC__TARGETS__REMOVAL_GRACE_SECS");

    let config = config.unwrap();
    assert_eq!(config.cluster.kubeconfig, "/from/env");
    assert_eq!(config.targets.removal_grace_secs, 30);
    // values absent from the environment still come from the file
    assert_eq!(config.targets.port, 9200);
}

use assert_cmd::Command;

fn bin() -> Command { Command::cargo_bin("observability-operator").unwrap() }

#[test]
fn help_works() { bin().arg("--help").assert().success(); }

#[test]
fn version_works() { bin().arg("--version").assert().success(); }

#[test]
fn go_style_help_works() { bin().arg("-help").assert().success(); }

#[test]
fn unknown_flag_is_usage_error() {
    let assert = bin().arg("--nonexistent").assert().failure();
    assert_eq!(assert.get_output().status.code(), Some(2));
}

#[test]
fn missing_cluster_config_exits_one() {
    let tmp = std::env::temp_dir().join("observability-operator-no-such-kubeconfig");
    let assert = bin()
        .env_remove("KUBERNETES_SERVICE_HOST")
        .env_remove("KUBERNETES_SERVICE_PORT")
        .env("KUBECONFIG", &tmp)
        .args(["-metrics-addr=0", "--health-probe-addr=0"])
        .assert()
        .failure();
    assert_eq!(assert.get_output().status.code(), Some(1));
}

#[test]
fn crd_gen_prints_observability_crd() {
    let out = Command::cargo_bin("crd-gen").unwrap().assert().success().get_output().stdout.clone();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("observabilities.observability.redhat.com"));
    assert!(text.contains("kind: CustomResourceDefinition"));
}

use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn xp(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_xp"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("spawn xp")
}

fn add_local_context(config: &Path) {
    let out = xp(
        config,
        &["context", "add", "--name", "laptop", "--backend-type", "local", "--storage-dir", "/tmp/s"],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let out = xp(config, &["context", "set-active", "laptop"]);
    assert!(out.status.success());
}

#[cfg(unix)]
#[test]
fn run_exits_with_the_experiment_exit_code() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("config.yaml");
    add_local_context(&config);
    let script = dir.path().join("train.sh");
    fs::write(&script, "exit 3\n").expect("script");
    fs::write(dir.path().join("train.experiments.yaml"), "spec:\n  name: hello\n").expect("descriptor");

    let out = xp(&config, &["run", "--json", script.to_str().expect("utf8")]);
    assert_eq!(out.status.code(), Some(3));
    let payload: Value = serde_json::from_slice(&out.stdout).expect("json summary");
    assert_eq!(payload["exit_code"], 3);
    assert_eq!(payload["context"], "laptop");
    assert!(!dir.path().join("xp_train").exists());
}

#[test]
fn json_errors_use_the_envelope_and_exit_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("config.yaml");
    let out = xp(&config, &["context", "show", "missing", "--json"]);
    assert_eq!(out.status.code(), Some(1));
    let payload: Value = serde_json::from_slice(&out.stdout).expect("json envelope");
    assert_eq!(payload["ok"], false);
    assert_eq!(payload["error"]["code"], "configuration_error");
}

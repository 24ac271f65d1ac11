use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const CONFIG: &str = r#"
gateway:
  name: smoke-plant
runtime:
  comm_monitor_interval_ms: 50
connectors:
  - name: plc1
    type: modbus_tcp
    host: ${MTP_SMOKE_HOST:-127.0.0.1}
    port: 15020
    poll_interval_ms: 50
tags:
  - { name: Pump.StateCur, connector: plc1, address: "40001", datatype: uint16 }
  - { name: Pump.CommandOp, connector: plc1, address: "40002", datatype: uint16, writable: true }
  - { name: Tank.Level, connector: plc1, address: "30001", datatype: float32, scale: { gain: 0.01, offset: 0.0 } }
services:
  - name: Pump
    mode: thin_proxy
    state_cur_tag: Pump.StateCur
    command_op_tag: Pump.CommandOp
  - name: Mixer
    mode: thick_proxy
safety:
  write_allowlist: [Pump.CommandOp]
"#;

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mtp-gateway"))
}

fn write_config(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).expect("write config");
    path
}

fn run(args: &[&str]) -> Output {
    Command::new(binary())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to start gateway")
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

#[test]
fn check_config_accepts_valid_document() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "gateway.yaml", CONFIG);

    let output = run(&["--config", path_str(&config), "--check-config"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Configuration OK: 1 connectors, 3 tags, 2 services"));
}

#[test]
fn check_config_rejects_dangling_reference() {
    let dir = TempDir::new().unwrap();
    let broken = CONFIG.replace("write_allowlist: [Pump.CommandOp]", "write_allowlist: [Pump.Missing]");
    let config = write_config(&dir, "gateway.yaml", &broken);

    let output = run(&["--config", path_str(&config), "--check-config"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Pump.Missing"), "stderr: {stderr}");
}

#[test]
fn override_is_merged_before_validation() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "gateway.yaml", CONFIG);
    let overlay = write_config(
        &dir,
        "site.yaml",
        "connectors:\n  - { name: plc1, type: simulated }\n  - { name: plc1, type: simulated }\n",
    );

    let output = run(&[
        "--config",
        path_str(&config),
        "--override",
        path_str(&overlay),
        "--check-config",
    ]);
    assert!(!output.status.success());
}

#[test]
fn missing_config_fails() {
    let output = run(&["--check-config"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--config"));
}

#[test]
fn help_prints_usage() {
    let output = run(&["--help"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("USAGE:"));
}

#[test]
fn simulated_run_writes_audit_trail() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "gateway.yaml", CONFIG);
    let audit = dir.path().join("audit").join("audit.jsonl");

    let output = run(&[
        "--config",
        path_str(&config),
        "--simulate",
        "--run-seconds",
        "1",
        "--audit-log",
        path_str(&audit),
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let content = std::fs::read_to_string(&audit).expect("audit log written");
    let events: Vec<serde_json::Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).expect("valid JSONL"))
        .collect();
    assert_eq!(events.first().unwrap()["event_type"], "system_start");
    assert_eq!(events.last().unwrap()["event_type"], "system_shutdown");
    assert_eq!(events[0]["details"]["gateway"], "smoke-plant");
}

#[test]
fn bundled_example_config_is_valid() {
    let example = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/gateway.example.yaml");
    let output = run(&["--config", path_str(&example), "--check-config"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Configuration OK: 1 connectors, 6 tags, 2 services"));
}

#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn vault(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("vault").unwrap();
    cmd.current_dir(dir.path()).env("VAULT_PATH", dir.path());
    cmd
}

fn init_vault(dir: &TempDir) {
    vault(dir).arg("init").assert().success();
}

fn write_item(dir: &TempDir, stage_dir: &str, id: &str, status: &str) {
    let body = format!(
        "---\ntype: customer_email\ncreated: 2026-01-05T09:00:00+00:00\nstatus: {status}\n---\n\n# {id}\n"
    );
    std::fs::write(dir.path().join(stage_dir).join(format!("{id}.md")), body).unwrap();
}

fn json_out(cmd: &mut Command) -> serde_json::Value {
    let out = cmd.output().unwrap();
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    serde_json::from_slice(&out.stdout).unwrap()
}

// ---------------------------------------------------------------------------
// vault init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_stage_tree() {
    let dir = TempDir::new().unwrap();
    vault(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: Needs_Action/"));

    for d in [
        "Needs_Action",
        "Pending_Approval",
        "Approved",
        "Rejected",
        "Done",
        "Quarantine",
        "Logs",
        "Briefings",
        "Orders",
        ".vault",
    ] {
        assert!(dir.path().join(d).is_dir(), "{d} missing");
    }
    assert!(dir.path().join(".vault/config.yaml").exists());
}

#[test]
fn init_is_idempotent_and_keeps_config() {
    let dir = TempDir::new().unwrap();
    init_vault(&dir);
    let config = dir.path().join(".vault/config.yaml");
    std::fs::write(&config, "reflection:\n  window_days: 3\n").unwrap();

    vault(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .vault/config.yaml"));
    assert_eq!(
        std::fs::read_to_string(&config).unwrap(),
        "reflection:\n  window_days: 3\n"
    );
}

// ---------------------------------------------------------------------------
// vault config
// ---------------------------------------------------------------------------

#[test]
fn default_config_validates() {
    let dir = TempDir::new().unwrap();
    init_vault(&dir);
    vault(&dir).args(["config", "validate"]).assert().success();
}

#[test]
fn config_validate_rejects_bad_schedule() {
    let dir = TempDir::new().unwrap();
    init_vault(&dir);
    std::fs::write(
        dir.path().join(".vault/config.yaml"),
        "schedule:\n  jobs:\n    - name: nightly\n      at: \"25:99\"\n      action: daily_summary\n",
    )
    .unwrap();

    vault(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("error"));
}

#[test]
fn config_show_json_fills_defaults() {
    let dir = TempDir::new().unwrap();
    init_vault(&dir);
    std::fs::write(
        dir.path().join(".vault/config.yaml"),
        "reflection:\n  window_days: 3\n",
    )
    .unwrap();

    let json = json_out(vault(&dir).args(["config", "show", "--json"]));
    assert_eq!(json["reflection"]["window_days"], 3);
    assert!(json["thresholds"].is_object());
}

// ---------------------------------------------------------------------------
// vault status
// ---------------------------------------------------------------------------

#[test]
fn status_counts_items_per_stage() {
    let dir = TempDir::new().unwrap();
    init_vault(&dir);
    write_item(&dir, "Needs_Action", "EMAIL_a", "pending");
    write_item(&dir, "Needs_Action", "EMAIL_b", "pending");
    write_item(&dir, "Pending_Approval", "EMAIL_REPLY_a", "pending_approval");

    let json = json_out(vault(&dir).args(["status", "--json"]));
    assert_eq!(json["stages"]["needs_action"], 2);
    assert_eq!(json["stages"]["pending_approval"], 1);
    assert_eq!(json["stages"]["done"], 0);

    // Created in January, so past the default approval lag.
    let overdue = json["overdue"].as_array().unwrap();
    assert!(overdue.iter().any(|o| o["id"] == "EMAIL_REPLY_a"));
}

#[test]
fn status_works_while_index_is_held_open() {
    let dir = TempDir::new().unwrap();
    init_vault(&dir);
    write_item(&dir, "Needs_Action", "EMAIL_a", "pending");
    let _running = vault_core::vault::Vault::open(dir.path(), vault_core::types::ExecutionMode::Live).unwrap();

    let json = json_out(vault(&dir).args(["status", "--json"]));
    assert_eq!(json["stages"]["needs_action"], 1);
    assert!(json["note"].as_str().unwrap().contains("escalations unavailable"));
}

#[test]
fn status_without_vault_suggests_init() {
    let dir = TempDir::new().unwrap();
    vault(&dir)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("vault init"));
}

// ---------------------------------------------------------------------------
// vault reflect
// ---------------------------------------------------------------------------

#[test]
fn reflect_writes_report() {
    let dir = TempDir::new().unwrap();
    init_vault(&dir);

    vault(&dir)
        .args(["reflect", "--days", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("written:"));

    let reports: Vec<_> = std::fs::read_dir(dir.path().join("Briefings"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("REFLECTION_"))
        .collect();
    assert_eq!(reports.len(), 1);
}

#[test]
fn reflect_dry_run_writes_no_report() {
    let dir = TempDir::new().unwrap();
    init_vault(&dir);

    let json = json_out(vault(&dir).args(["reflect", "--dry-run", "--json"]));
    assert!(json["path"].is_null());
    assert!(json["report"]["score"].is_string());
    assert_eq!(std::fs::read_dir(dir.path().join("Briefings")).unwrap().count(), 0);
}

#[test]
fn reflect_rejects_zero_days() {
    let dir = TempDir::new().unwrap();
    init_vault(&dir);
    vault(&dir).args(["reflect", "--days", "0"]).assert().failure();
}

// ---------------------------------------------------------------------------
// vault run
// ---------------------------------------------------------------------------

#[test]
fn run_on_missing_root_exits_2() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope");
    Command::cargo_bin("vault")
        .unwrap()
        .env("VAULT_PATH", &missing)
        .args(["run", "--dry-run"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn run_with_invalid_config_exits_3() {
    let dir = TempDir::new().unwrap();
    init_vault(&dir);
    std::fs::write(
        dir.path().join(".vault/config.yaml"),
        "schedule:\n  jobs:\n    - name: nightly\n      at: \"25:99\"\n      action: daily_summary\n",
    )
    .unwrap();

    vault(&dir).args(["run", "--dry-run"]).assert().code(3);
}

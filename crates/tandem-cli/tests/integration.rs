#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const WORKFLOW: &str = r#"
id: checkout
description: Cart totals and payment capture
workers:
  - { id: tester, role: test_writer, ownership: ["tests/**"] }
  - { id: dev, role: implementer, ownership: ["src/**"] }
  - { id: tidy, role: refactorer, ownership: ["src/**"] }
  - { id: critic, role: reviewer }
lanes:
  - { name: cart, feature: cart totals, tests: ["tests/cart/**"], source: ["src/cart/**"] }
  - name: pay
    feature: payment capture
    tests: ["tests/pay/**"]
    source: ["src/pay/**"]
    after: ["cart-green"]
"#;

const CYCLIC: &str = r#"
id: loop
workers:
  - { id: dev, role: implementer }
tasks:
  - { id: a, description: a, role: implementer, lane: l, phase: 1, depends_on: [b] }
  - { id: b, description: b, role: implementer, lane: l, phase: 2, depends_on: [a] }
"#;

const FLAKY: &str = r#"
id: notes
workers:
  - { id: scout, role: analyst }
tasks:
  - { id: survey, description: survey the code, role: analyst, lane: notes, phase: 1, command: "exit 3" }
  - { id: summary, description: summarize findings, role: analyst, lane: notes, phase: 2, depends_on: [survey], command: "true" }
"#;

fn tandem(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tandem").unwrap();
    cmd.current_dir(dir.path()).env("TANDEM_ROOT", dir.path());
    cmd
}

fn init_project(dir: &TempDir) {
    tandem(dir).arg("init").assert().success();
}

fn write_workflow(dir: &TempDir, name: &str, body: &str) -> String {
    std::fs::write(dir.path().join(name), body).unwrap();
    name.to_string()
}

fn run_checkout(dir: &TempDir) {
    let wf = write_workflow(dir, "checkout.yaml", WORKFLOW);
    tandem(dir)
        .args(["run", &wf, "--simulate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Workflow checkout: completed"));
}

// ---------------------------------------------------------------------------
// tandem init / config
// ---------------------------------------------------------------------------

#[test]
fn init_creates_directory_tree() {
    let dir = TempDir::new().unwrap();
    tandem(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .tandem/config.yaml"));

    assert!(dir.path().join(".tandem").is_dir());
    assert!(dir.path().join(".tandem/contexts").is_dir());
    assert!(dir.path().join(".tandem/config.yaml").exists());
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    tandem(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .tandem/config.yaml"));
}

#[test]
fn commands_require_init() {
    let dir = TempDir::new().unwrap();
    tandem(&dir)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("run 'tandem init'"));
}

#[test]
fn config_show_and_validate() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    tandem(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stall_window_secs: 600"));
    tandem(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_validate_reports_errors() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(
        dir.path().join(".tandem/config.yaml"),
        "context:\n  soft_limit_bytes: 1000\n  hard_limit_bytes: 500\n",
    )
    .unwrap();
    tandem(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] context.soft_limit_bytes"));
}

// ---------------------------------------------------------------------------
// tandem plan
// ---------------------------------------------------------------------------

#[test]
fn plan_validate_summarizes_workflow() {
    let dir = TempDir::new().unwrap();
    let wf = write_workflow(&dir, "checkout.yaml", WORKFLOW);
    tandem(&dir)
        .args(["plan", "validate", &wf])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Workflow 'checkout' is valid: 8 tasks across 2 lanes, 4 workers.",
        ));
}

#[test]
fn plan_validate_rejects_cycles() {
    let dir = TempDir::new().unwrap();
    let wf = write_workflow(&dir, "loop.yaml", CYCLIC);
    tandem(&dir)
        .args(["plan", "validate", &wf])
        .assert()
        .failure()
        .stderr(predicate::str::contains("would create a cycle"));
}

#[test]
fn plan_order_lists_waves_as_json() {
    let dir = TempDir::new().unwrap();
    let wf = write_workflow(&dir, "checkout.yaml", WORKFLOW);
    let output = tandem(&dir)
        .args(["plan", "order", &wf, "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let waves: Vec<Vec<String>> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(waves[0], vec!["cart-red"]);
    assert_eq!(waves[1], vec!["cart-green"]);
    assert_eq!(waves[2], vec!["cart-refactor", "pay-red"]);
}

// ---------------------------------------------------------------------------
// tandem run / status / context
// ---------------------------------------------------------------------------

#[test]
fn simulated_run_completes_and_persists_context() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    run_checkout(&dir);

    assert!(dir
        .path()
        .join(".tandem/contexts/checkout/context.json")
        .exists());
    tandem(&dir)
        .args(["context", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("checkout"));
    tandem(&dir)
        .args(["status", "checkout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("checkout [complete] 8/8 completed"))
        .stdout(predicate::str::contains("pay-review"));
}

#[test]
fn second_run_requires_resume() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    run_checkout(&dir);

    tandem(&dir)
        .args(["run", "checkout.yaml", "--simulate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--resume"));
    tandem(&dir)
        .args(["run", "checkout.yaml", "--simulate", "--resume"])
        .assert()
        .success();
}

#[test]
fn context_show_json_contains_log() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    run_checkout(&dir);

    let output = tandem(&dir)
        .args(["context", "show", "checkout", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["source"], "primary");
    assert_eq!(value["context"]["workflow_id"], "checkout");
    assert!(!value["context"]["log"].as_array().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// tandem checkpoint
// ---------------------------------------------------------------------------

#[test]
fn checkpoint_create_list_and_rollback() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    run_checkout(&dir);

    tandem(&dir)
        .args(["checkpoint", "list", "checkout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("integration_barrier"));

    tandem(&dir)
        .args(["checkpoint", "create", "checkout", "--label", "before release"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(manual): before release"));

    tandem(&dir)
        .args(["checkpoint", "rollback", "checkout", "cp-0001"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Rolled back 'checkout' to cp-0001"));

    tandem(&dir)
        .args(["checkpoint", "list", "checkout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pre_rollback"))
        .stdout(predicate::str::contains("before release"));
}

#[test]
fn checkpoint_rollback_unknown_id_fails() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    run_checkout(&dir);

    tandem(&dir)
        .args(["checkpoint", "rollback", "checkout", "cp-9999"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("checkpoint not found"));
}

// ---------------------------------------------------------------------------
// tandem task
// ---------------------------------------------------------------------------

#[test]
fn task_accept_and_unblock_update_saved_context() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let wf = write_workflow(&dir, "notes.yaml", FLAKY);
    tandem(&dir).args(["run", &wf]).assert().failure();

    tandem(&dir)
        .args(["task", "unblock", &wf, "summary"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("dependency 'survey' failed"));
    tandem(&dir)
        .args(["task", "accept", &wf, "summary"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot accept 'summary'"));
    tandem(&dir)
        .args(["task", "accept", &wf, "survey"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Accepted failure of 'survey' in 'notes'"));

    let output = tandem(&dir)
        .args(["context", "show", "notes", "--json"])
        .output()
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["context"]["accepted_failures"][0], "survey");
    assert_eq!(value["context"]["task_status"]["survey"], "failed");
}

//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

const EXIT_UNAVAILABLE: i32 = 3;

struct Workspace {
    tmp: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        std::fs::write(tmp.path().join("hangar.toml"), "")
            .unwrap_or_else(|err| panic!("write config: {err}"));
        Self { tmp }
    }

    fn path(&self, name: &str) -> String {
        self.tmp.path().join(name).to_string_lossy().into_owned()
    }

    fn hangar(&self, args: &[&str]) -> Command {
        let mut cmd = cargo_bin_cmd!("hangar");
        cmd.current_dir(self.tmp.path())
            .env("HANGAR_CONFIG_PATH", self.path("hangar.toml"))
            .env("HANGAR_PROJECT_NAME", "smoke")
            .env("HANGAR_BACKEND", "local")
            .env("HANGAR_BACKEND_DIR", self.path("pools"))
            .env_remove("HANGAR_PROVISION_COMMAND")
            .env_remove("HANGAR_ACTIVATE_COMMAND")
            .env_remove("HANGAR_LOG")
            .args(args);
        cmd
    }
}

const HANDLE_JSON: &str = r#"{
  "id": "vm-1",
  "display_alias": "runner one",
  "activation_secret": "top-secret",
  "created_at": "2026-01-02T03:04:05Z",
  "status": "ready"
}"#;

#[test]
fn help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("hangar");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("checkout").and(predicate::str::contains("refill")));
}

#[test]
fn status_of_a_fresh_pool_is_empty() {
    let workspace = Workspace::new();
    workspace
        .hangar(&["status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"size\": 0"))
        .stdout(predicate::str::contains("pool_smoke"));
}

#[test]
fn checkout_of_an_empty_pool_exits_unavailable() {
    let workspace = Workspace::new();
    workspace
        .hangar(&["checkout"])
        .assert()
        .code(EXIT_UNAVAILABLE)
        .stdout("")
        .stderr(predicate::str::contains("pool is empty"));
}

#[test]
fn checked_in_handle_is_listed_without_its_secret() {
    let workspace = Workspace::new();
    workspace
        .hangar(&["checkin"])
        .write_stdin(HANDLE_JSON)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"inserted\""));

    workspace
        .hangar(&["status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("runner one"))
        .stdout(predicate::str::contains("top-secret").not());

    workspace
        .hangar(&["checkout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("top-secret"));
}

#[test]
fn checkin_stamps_the_pooled_handle() {
    let workspace = Workspace::new();
    workspace
        .hangar(&["checkin"])
        .write_stdin(HANDLE_JSON)
        .assert()
        .success();

    workspace
        .hangar(&["status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"checked_in_at\""));
}

#[test]
fn checkin_twice_reports_already_present() {
    let workspace = Workspace::new();
    let handle_path = workspace.path("handle.json");
    std::fs::write(&handle_path, HANDLE_JSON).unwrap_or_else(|err| panic!("write: {err}"));

    workspace
        .hangar(&["checkin", &handle_path])
        .assert()
        .success();
    workspace
        .hangar(&["checkin", "--front", &handle_path])
        .assert()
        .success()
        .stdout(predicate::str::contains("already_present"));
}

#[test]
fn malformed_handle_is_rejected() {
    let workspace = Workspace::new();
    workspace
        .hangar(&["checkin"])
        .write_stdin("{ not json")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid handle input"));
}

#[test]
fn refill_without_provision_command_names_the_setting() {
    let workspace = Workspace::new();
    workspace
        .hangar(&["refill", "--target", "1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("HANGAR_PROVISION_COMMAND"));
}

#[cfg(unix)]
#[test]
fn refill_runs_the_provision_command() {
    let workspace = Workspace::new();
    let script = workspace.path("provision.sh");
    std::fs::write(
        &script,
        "printf '{\"id\":\"vm-%s\",\"activation_secret\":\"tok\"}' \"$$\"\n",
    )
    .unwrap_or_else(|err| panic!("write script: {err}"));

    workspace
        .hangar(&["refill", "--target", "2"])
        .env("HANGAR_PROVISION_COMMAND", format!("sh {script}"))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"failures\": []"));

    workspace
        .hangar(&["status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"size\": 2"));
}

#[test]
fn ready_accepts_a_local_backend() {
    let workspace = Workspace::new();
    workspace
        .hangar(&["ready"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ready\": true"));
}

#[test]
fn ready_setup_saves_prompted_backend_settings() {
    let workspace = Workspace::new();
    let config_path = workspace.path("hangar.toml");
    std::fs::write(&config_path, "backend = \"local\"\n")
        .unwrap_or_else(|err| panic!("write config: {err}"));

    workspace
        .hangar(&["ready", "--setup"])
        .env("HANGAR_BACKEND", "http")
        .env_remove("HANGAR_BACKEND_URL")
        .env_remove("HANGAR_BACKEND_TOKEN")
        .env_remove("CI")
        .write_stdin("https://kv.example.com/pools\nt0k\n\n\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ready\": true"))
        .stderr(predicate::str::contains("replacing the recorded `local` backend with http"));

    let saved =
        std::fs::read_to_string(&config_path).unwrap_or_else(|err| panic!("read config: {err}"));
    assert!(saved.contains("backend = \"http\""), "{saved}");
    assert!(saved.contains("https://kv.example.com/pools"), "{saved}");
}

//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn registry_dir() -> (TempDir, String) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = tmp.path().join("registry.json");
    let path = path
        .to_str()
        .unwrap_or_else(|| panic!("temp path should be utf8: {}", path.display()))
        .to_owned();
    (tmp, path)
}

#[test]
fn help_lists_the_subcommands() {
    let mut cmd = cargo_bin_cmd!("forester");
    cmd.arg("--help").assert().success().stdout(
        predicate::str::contains("create")
            .and(predicate::str::contains("grow"))
            .and(predicate::str::contains("destroy"))
            .and(predicate::str::contains("status")),
    );
}

#[test]
fn missing_subcommand_is_a_usage_error() {
    let mut cmd = cargo_bin_cmd!("forester");
    cmd.assert().failure().stderr(predicate::str::contains("Usage"));
}

#[test]
fn empty_registry_lists_nothing() {
    let (_tmp, path) = registry_dir();
    let mut cmd = cargo_bin_cmd!("forester");
    cmd.env("FORESTER_REGISTRY_FILE", &path)
        .env_remove("FORESTER_REGISTRY_URL")
        .arg("list")
        .assert()
        .success()
        .stdout("no forests registered\n");
}

#[test]
fn unknown_forest_status_fails() {
    let (_tmp, path) = registry_dir();
    let mut cmd = cargo_bin_cmd!("forester");
    cmd.env("FORESTER_REGISTRY_FILE", &path)
        .env_remove("FORESTER_REGISTRY_URL")
        .args(["status", "forest-missing"])
        .assert()
        .code(1)
        .stdout("")
        .stderr(predicate::str::contains("forest-missing"));
}

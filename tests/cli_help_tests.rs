// CLI surface: help text, aliases and offline commands

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn merge_conductor(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("merge-conductor").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("GITHUB_TOKEN")
        .env_remove("MERGE_CONDUCTOR_GITHUB__TOKEN")
        .env("RUST_LOG", "off");
    cmd
}

fn write_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("conductor.toml");
    std::fs::write(
        &path,
        format!(
            "repositories = [\"acme/widgets\"]\nstate_dir = \"{}\"\n",
            dir.path().join("state").display()
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_help_lists_every_command() {
    let dir = TempDir::new().unwrap();
    merge_conductor(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("analyze"))
        .stdout(predicate::str::contains("process"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("clear"));
}

#[test]
fn test_process_help_shows_batch_options() {
    let dir = TempDir::new().unwrap();
    merge_conductor(&dir)
        .args(["process", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--max-concurrent"))
        .stdout(predicate::str::contains("--dry-run"));
}

#[test]
fn test_run_is_an_alias_for_process() {
    let dir = TempDir::new().unwrap();
    merge_conductor(&dir)
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"));
}

#[test]
fn test_status_works_without_a_token() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    merge_conductor(&dir)
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("MERGE QUEUE"))
        .stdout(predicate::str::contains("Queue is empty"));
}

#[test]
fn test_process_without_a_token_exits_with_failure() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    merge_conductor(&dir)
        .arg("--config")
        .arg(&config)
        .arg("process")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("GITHUB_TOKEN"));
}

#[test]
fn test_clear_rejects_malformed_ids() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    merge_conductor(&dir)
        .arg("--config")
        .arg(&config)
        .args(["clear", "not-an-id"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("owner/name#number"));
}

#[test]
fn test_clear_of_unqueued_request_fails() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    merge_conductor(&dir)
        .arg("--config")
        .arg(&config)
        .args(["clear", "acme/widgets#42"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not queued"));
}

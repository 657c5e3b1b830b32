use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_flags() {
    Command::cargo_bin("stratod")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--no-network"));
}

#[test]
fn test_dump_config_prints_defaults() {
    Command::cargo_bin("stratod")
        .unwrap()
        .args(["--dump-config", "--server-url", "sched.example.com:9000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("server_url = \"sched.example.com:9000\""))
        .stdout(predicate::str::contains("[database]"));
}

#[test]
fn test_rejects_unreadable_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "this is not toml [").unwrap();

    Command::cargo_bin("stratod")
        .unwrap()
        .args(["--config", path.to_str().unwrap(), "--dump-config"])
        .assert()
        .failure();
}

mod common;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use common::{closed_url, create_config_file, TestServer};

fn tmq() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tmq"));
    cmd.env_remove("TMQ_CONFIG")
        .env_remove("TMQ_URL")
        .env_remove("TMQ_PASSWORD")
        .env("RUST_LOG", "off");
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    tmq()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("consume"))
        .stdout(predicate::str::contains("commit-offset"))
        .stdout(predicate::str::contains("assignment"));
}

#[test]
fn test_missing_group_is_rejected() {
    tmq()
        .args(["topics", "-t", "T"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("group.id is required"));
}

#[test]
fn test_unknown_setting_is_rejected() {
    tmq()
        .args(["-g", "g1", "-X", "no.such.key=1", "topics", "-t", "T"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown configuration key"));
}

#[test]
fn test_invalid_config_file() {
    let dir = TempDir::new().unwrap();
    let path = create_config_file(&dir, "tmq.yaml", &["ws:", "  url: ws://x"]);

    tmq()
        .arg("-c")
        .arg(&path)
        .args(["topics", "-t", "T"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("must be a scalar"));
}

#[test]
fn test_connection_refused() {
    tmq()
        .args(["--url", &closed_url(), "-g", "g1", "topics", "-t", "T"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to connect"));
}

#[test]
fn test_topics_lists_subscription() {
    let server = TestServer::start();

    tmq()
        .args(["--url", &server.url, "-g", "g1", "topics", "-t", "meters", "-t", "alarms"])
        .assert()
        .success()
        .stdout(predicate::str::contains("meters"))
        .stdout(predicate::str::contains("alarms"));
}

#[test]
fn test_consume_stops_after_idle_polls() {
    let server = TestServer::start();

    tmq()
        .args(["--url", &server.url, "-g", "g1"])
        .args(["consume", "-t", "meters", "--idle-polls", "2", "--poll-timeout", "10ms"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 messages"));
}

#[test]
fn test_assignment_shows_ranges() {
    let server = TestServer::start();

    tmq()
        .args(["--url", &server.url, "-g", "g1", "assignment", "-t", "meters"])
        .assert()
        .success()
        .stdout(predicate::str::contains("vgroup 2"))
        .stdout(predicate::str::contains("begin 10\tend 60"));
}

#[test]
fn test_commit_offset_then_committed() {
    let server = TestServer::start();
    let dir = TempDir::new().unwrap();
    let config = create_config_file(
        &dir,
        "tmq.yaml",
        &[
            &format!("ws.url: {}", server.url),
            "group.id: g1",
            "client.id: cli",
            "ws.message.timeout: 5s",
        ],
    );

    tmq()
        .arg("-c")
        .arg(&config)
        .args(["commit-offset", "-t", "meters", "--vgroup", "5", "--offset", "42"])
        .assert()
        .success()
        .stdout(predicate::str::contains("meters\tvgroup 5\toffset 42"));

    // Each invocation is a new connection; the server keeps offsets
    tmq()
        .arg("-c")
        .arg(&config)
        .args(["committed", "-t", "meters", "--vgroup", "5,2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("meters\tvgroup 5\toffset 42"))
        .stdout(predicate::str::contains("meters\tvgroup 2\toffset INVALID"));
}

#[test]
fn test_seek_then_position_of_assigned_vgroups() {
    let server = TestServer::start();

    tmq()
        .args(["--url", &server.url, "-g", "g1"])
        .args(["seek", "-t", "meters", "--vgroup", "2", "--offset", "7"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Seeked meters[2]@7"));

    tmq()
        .args(["--url", &server.url, "-g", "g1", "position", "-t", "meters"])
        .assert()
        .success()
        .stdout(predicate::str::contains("meters\tvgroup 2\toffset 7"))
        .stdout(predicate::str::contains("meters\tvgroup 5\toffset INVALID"));
}

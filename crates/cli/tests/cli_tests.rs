//! CLI integration tests

use std::process::{Command, Output};

fn fleetctl(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fleetctl"))
        .args(args)
        .env_remove("FLEET_API_URL")
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = fleetctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("Load Fleet"), "Should show app name");
    for command in ["agents", "executions", "heartbeat", "plans", "config"] {
        assert!(stdout.contains(command), "Should show {} command", command);
    }
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = fleetctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("fleetctl"), "Should show binary name");
}

#[test]
fn test_heartbeat_help() {
    let output = fleetctl(&["heartbeat", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    for command in ["check", "check-async", "status", "cleanup", "task"] {
        assert!(stdout.contains(command), "Should show {} subcommand", command);
    }
}

#[test]
fn test_cleanup_help() {
    let output = fleetctl(&["heartbeat", "cleanup", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--threshold-minutes"));
    assert!(stdout.contains("--background"));
}

#[test]
fn test_executions_stop_help() {
    let output = fleetctl(&["executions", "stop", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--reason"), "Should show reason option");
}

#[test]
fn test_executions_list_help() {
    let output = fleetctl(&["executions", "list", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--status"));
    assert!(stdout.contains("--agent"));
    assert!(stdout.contains("--limit"));
}

/// Test format and api-url options
#[test]
fn test_global_options() {
    let output = fleetctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("--format"), "Should show format option");
    assert!(stdout.contains("table"), "Should show table format");
    assert!(stdout.contains("json"), "Should show json format");
    assert!(stdout.contains("--api-url"), "Should show api-url option");
    assert!(stdout.contains("FLEET_API_URL"), "Should show env var");
}

/// Test invalid command error handling
#[test]
fn test_invalid_command() {
    let output = fleetctl(&["invalid-command"]);
    assert!(!output.status.success(), "Invalid command should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error"), "Should show error message");
}

/// Test missing required argument error handling
#[test]
fn test_missing_argument() {
    let output = fleetctl(&["executions", "start"]);
    assert!(!output.status.success(), "Missing argument should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("required") || stderr.contains("error"),
        "Should show error about missing argument"
    );
}

#[test]
fn test_non_numeric_id_rejected() {
    let output = fleetctl(&["agents", "show", "abc"]);
    assert!(!output.status.success());
}

/// An unreachable server is reported and exits non-zero
#[test]
fn test_unreachable_server() {
    let output = fleetctl(&["--api-url", "http://127.0.0.1:9", "heartbeat", "status"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to send request"));
}

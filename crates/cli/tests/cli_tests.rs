//! CLI integration tests

use std::process::Command;

fn tpl(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_tpl"))
        .args(args)
        .env_remove("TPL_API_URL")
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = tpl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("telemetry pipeline"), "Should show app name");
    assert!(stdout.contains("ingest"), "Should show ingest command");
    assert!(stdout.contains("rules"), "Should show rules command");
    assert!(stdout.contains("alerts"), "Should show alerts command");
    assert!(stdout.contains("aggregates"), "Should show aggregates command");
    assert!(stdout.contains("anomalies"), "Should show anomalies command");
    assert!(stdout.contains("status"), "Should show status command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = tpl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("tpl"), "Should show binary name");
}

/// Test alerts list subcommand help
#[test]
fn test_alerts_list_help() {
    let output = tpl(&["alerts", "list", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Alerts list help should succeed");
    assert!(stdout.contains("--state"), "Should show state option");
}

/// Test rules apply subcommand help
#[test]
fn test_rules_apply_help() {
    let output = tpl(&["rules", "apply", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Rules apply help should succeed");
    assert!(stdout.contains("file"), "Should show file argument");
}

/// Test anomalies subcommand help
#[test]
fn test_anomalies_help() {
    let output = tpl(&["anomalies", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Anomalies help should succeed");
    assert!(stdout.contains("--flagged"), "Should show flagged option");
    assert!(stdout.contains("--metric"), "Should show metric option");
}

/// Test format and api-url options
#[test]
fn test_global_options() {
    let output = tpl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("--format"), "Should show format option");
    assert!(stdout.contains("--api-url"), "Should show api-url option");
    assert!(stdout.contains("TPL_API_URL"), "Should show env var");
}

/// Test invalid command error handling
#[test]
fn test_invalid_command() {
    let output = tpl(&["invalid-command"]);
    assert!(!output.status.success(), "Invalid command should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error") || stderr.contains("invalid"),
        "Should show error message"
    );
}

/// Test missing required argument error handling
#[test]
fn test_missing_argument() {
    let output = tpl(&["alerts", "ack"]);
    assert!(!output.status.success(), "Missing argument should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("required") || stderr.contains("error"),
        "Should show error about missing argument"
    );
}

/// Test that an unreachable daemon produces an error exit
#[test]
fn test_unreachable_daemon_fails() {
    let output = tpl(&["--api-url", "http://127.0.0.1:1", "status"]);
    assert!(!output.status.success(), "Unreachable daemon should fail");
}

//! CLI integration tests for warehouse-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! the offline dry-run plan and exit codes for configuration errors.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the warehouse-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("warehouse-migrate").unwrap()
}

/// A valid configuration with two tables in one source group.
fn config_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
source:
  host: warehouse.internal
  database: dw
  user: loader
  password: secret
target:
  host: localhost
  database: app
  user: loader
  password: secret
migration:
  parallel_threads: 6
  batch_size: 50000
sources:
  - name: analytics
    source_schema: ANALYTICS
    target_schema: analytics
    tables:
      - source: EVENTS
        target: events
        chunking_columns: [event_id]
        chunking_column_types: [bigint]
        uniqueness_columns: [event_id]
        truncate_onstart: true
      - source: SESSIONS
        target: sessions
        chunking_columns: [session_day]
        chunking_column_types: [date]
        uniqueness_columns: [session_id]
        source_watermark: updated_at
        target_watermark: updated_at
"#
    )
    .unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--source"))
        .stdout(predicate::str::contains("--resume-run-id"))
        .stdout(predicate::str::contains("--no-resume"))
        .stdout(predicate::str::contains("--resume-max-age"))
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--dry-run"));
}

#[test]
fn test_status_requires_run_id() {
    cmd()
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--run-id"));
}

#[test]
fn test_resume_flags_conflict() {
    cmd()
        .args(["run", "--resume-run-id", "abc", "--no-resume"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("warehouse-migrate"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_shutdown_timeout_default() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--shutdown-timeout"))
        .stdout(predicate::str::contains("[default: 60]"));
}

#[test]
fn test_output_json_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"));
}

#[test]
fn test_log_format_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"));
}

#[test]
fn test_verbosity_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"));
}

#[test]
fn test_config_default_path() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    // Missing file is an IO error (code 7), not config error (code 1)
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "health-check"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_empty_config_exits_with_code_1() {
    let file = tempfile::NamedTempFile::new().unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run", "--dry-run"])
        .assert()
        .code(1);
}

#[test]
fn test_missing_required_fields_exits_with_code_1() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source:").unwrap();
    writeln!(file, "  host: warehouse").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run", "--dry-run"])
        .assert()
        .code(1);
}

#[test]
fn test_unset_env_var_exits_with_code_1() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source:").unwrap();
    writeln!(file, "  password: ${{WAREHOUSE_MIGRATE_TEST_UNSET_VAR}}").unwrap();

    cmd()
        .env_remove("WAREHOUSE_MIGRATE_TEST_UNSET_VAR")
        .args(["--config", file.path().to_str().unwrap(), "run", "--dry-run"])
        .assert()
        .code(1);
}

// =============================================================================
// Dry Run Tests (no database needed)
// =============================================================================

#[test]
fn test_dry_run_prints_plan() {
    let file = config_file();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Dry run: 2 tables"))
        .stdout(predicate::str::contains("numeric_range on event_id"))
        .stdout(predicate::str::contains("date_range on session_day"))
        .stdout(predicate::str::contains("truncate"))
        .stdout(predicate::str::contains("incremental"));
}

#[test]
fn test_dry_run_json_plan_honours_workers_override() {
    let file = config_file();

    let output = cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "--output-json",
            "run",
            "--dry-run",
            "--workers",
            "3",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let plans: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let plans = plans.as_array().unwrap();
    assert_eq!(plans.len(), 2);
    assert_eq!(plans[0]["target_table"], "analytics.events");
    assert_eq!(plans[0]["strategy"], "numeric_range");
    assert_eq!(plans[0]["parallel_threads"], 3);
    assert_eq!(plans[1]["batch_size"], 50000);
}

#[test]
fn test_dry_run_unknown_source_exits_with_code_1() {
    let file = config_file();

    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "run",
            "--dry-run",
            "--source",
            "billing",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unknown source 'billing'"));
}

// =============================================================================
// No Subcommand Tests
// =============================================================================

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

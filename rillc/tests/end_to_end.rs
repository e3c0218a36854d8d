//! End-to-end tests for the `rillc` binary.
//!
//! Each test writes a program graph as JSON into an isolated temporary
//! directory and drives the CLI over it.

mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rillc::hir::Program;
use tempfile::TempDir;

// ============================================================================
// Test Infrastructure
// ============================================================================

fn write_program(dir: &TempDir, program: &Program) -> PathBuf {
    let path = dir.path().join("program.json");
    fs::write(&path, serde_json::to_string(program).unwrap()).unwrap();
    path
}

fn rillc(args: &[&str], file: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rillc"))
        .args(args.iter().take(1))
        .arg(file)
        .args(args.iter().skip(1))
        .env_remove("RILL_LOG")
        .env_remove("RILL_BACKEND")
        .env("RILL_EXHAUSTIVE_HANDLERS", "false")
        .output()
        .expect("failed to run rillc")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

// ============================================================================
// Commands
// ============================================================================

#[test]
fn test_check_prints_rows() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, &common::async_program(true));
    let output = rillc(&["check"], &file);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let text = stdout(&output);
    assert!(text.contains("fn inner: {Async.await} (exported)"), "{text}");
    assert!(text.contains("fn outer: pure (exported)"), "{text}");
}

#[test]
fn test_table_lists_ordinals() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, &common::forwarding_program());
    let output = rillc(&["table"], &file);
    assert!(output.status.success());

    let text = stdout(&output);
    let rows: Vec<&str> = text.lines().skip(1).collect();
    assert!(!rows.is_empty(), "{text}");
    assert!(rows.iter().any(|row| row.contains("Log.emit") && row.contains("tail")), "{text}");
    assert!(rows.iter().all(|row| row.contains("tail")), "{text}");
}

#[test]
fn test_run_agrees_across_backends() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, &common::async_program(false));
    for backend in ["interp", "structural"] {
        let output = rillc(
            &["run", "-f", "inner", "--arg", "i32:4", "--answer", "Async.await=i32:8", "--backend", backend],
            &file,
        );
        assert!(output.status.success(), "{backend}: {}", String::from_utf8_lossy(&output.stderr));
        assert_eq!(stdout(&output).trim(), "i32:9", "{backend}");
    }
}

#[test]
fn test_emit_writes_the_module() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, &common::count_program());
    let out = dir.path().join("module.json");
    let output = rillc(&["emit", "-o", out.to_str().unwrap()], &file);
    assert!(output.status.success());

    let module: rill_runtime::Module = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert!(module.find_export("count_effectful").is_some());
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_rejected_program_exits_with_one() {
    let dir = TempDir::new().unwrap();
    let file = write_program(&dir, &common::state_program(|f, _| f.i32(0)));
    let output = rillc(&["check"], &file);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("tail-resume-count"));
}

#[test]
fn test_unreadable_input_exits_with_two() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("program.json");
    fs::write(&file, "{ not json").unwrap();
    let output = rillc(&["check"], &file);
    assert_eq!(output.status.code(), Some(2));
}

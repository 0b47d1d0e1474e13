//! End-to-end tests for the `rankpipe` binary.

#![cfg(unix)]

use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

fn rankpipe(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rankpipe"))
        .args(args)
        .output()
        .expect("failed to run rankpipe")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn fixture(name: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
        .display()
        .to_string()
}

// ============================================================================
// run / pipe
// ============================================================================

#[test]
fn run_prints_program_output() {
    let output = rankpipe(&["run", "echo", "hello"]);
    assert!(output.status.success(), "{output:?}");
    assert_eq!(stdout(&output), "hello\n");
}

#[test]
fn run_propagates_exit_code() {
    let output = rankpipe(&["run", "--", "sh", "-c", "exit 3"]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn run_reports_missing_program_as_127() {
    let output = rankpipe(&["run", "definitely_not_a_real_command_12345"]);
    assert_eq!(output.status.code(), Some(127));
}

#[test]
fn run_json_report() {
    let output = rankpipe(&["run", "--json", "sh", "-c", "echo out; echo err >&2; exit 1"]);
    assert_eq!(output.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json report");
    assert_eq!(report["out"], "out\n");
    assert_eq!(report["err"], "err\n");
    assert_eq!(report["code"], 1);
    assert_eq!(report["status"]["exited"], 1);
}

#[test]
fn pipe_chains_stages() {
    let output = rankpipe(&["pipe", "echo hello", "tr a-z A-Z"]);
    assert!(output.status.success(), "{output:?}");
    assert_eq!(stdout(&output), "HELLO\n");
}

#[test]
fn short_grace_cuts_off_lingering_grandchild() {
    let started = Instant::now();
    let output = rankpipe(&["run", "--grace-ms", "100", "sh", "-c", "sleep 5 & echo bg"]);
    assert_eq!(stdout(&output), "bg\n");
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn interrupt_stops_child_that_ignores_sigterm() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_rankpipe"))
        .args(["run", "sh", "-c", "trap '' TERM; exec sleep 10"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn rankpipe");
    // Let the Ctrl-C handler get installed.
    std::thread::sleep(Duration::from_millis(500));

    let started = Instant::now();
    let sent = Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .expect("failed to run kill");
    assert!(sent.success());

    let status = child.wait().expect("wait for rankpipe");
    assert_eq!(status.code(), Some(130));
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
}

// ============================================================================
// args / mpi
// ============================================================================

#[test]
fn args_prints_collapsed_command_line() {
    let output = rankpipe(&["args", &fixture("job.json")]);
    assert!(output.status.success(), "{output:?}");
    assert_eq!(
        stdout(&output),
        "mpiexec -n 3 a.out --input in.nc : -n 1 env OMP_NUM_THREADS=2 b.out\n"
    );
}

#[test]
fn args_json_and_custom_launcher() {
    let output = rankpipe(&["args", "--json", "--launcher", "mpirun", &fixture("job.json")]);
    let args: Vec<String> = serde_json::from_slice(&output.stdout).expect("json array");
    assert_eq!(args[0], "mpirun");
    assert_eq!(args.iter().filter(|a| *a == ":").count(), 1);
}

#[test]
fn args_shell_mode_quotes_each_group() {
    let output = rankpipe(&["args", "--shell", &fixture("job.json")]);
    assert_eq!(
        stdout(&output),
        "mpiexec -n 3 'a.out --input in.nc' : -n 1 'env OMP_NUM_THREADS=2 b.out'\n"
    );
}

#[test]
fn mpi_runs_through_launcher() {
    let ok = rankpipe(&["mpi", "--launcher", "true", &fixture("job.json")]);
    assert!(ok.status.success(), "{ok:?}");
    let failed = rankpipe(&["mpi", "--launcher", "false", &fixture("job.json")]);
    assert_eq!(failed.status.code(), Some(1));
}

#[test]
fn missing_job_file_is_an_error() {
    let output = rankpipe(&["args", "/definitely/not/a/job.json"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to read job file"));
}

// ============================================================================
// Usage
// ============================================================================

#[test]
fn unknown_command_fails() {
    let output = rankpipe(&["frobnicate"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown command"));
}

#[test]
fn version_and_help() {
    let version = stdout(&rankpipe(&["--version"]));
    assert!(version.starts_with(concat!("rankpipe ", env!("CARGO_PKG_VERSION"), " (")), "{version}");
    assert!(version.ends_with(", debug)\n") || version.ends_with(", release)\n"), "{version}");
    assert!(stdout(&rankpipe(&["--help"])).contains("Usage:"));
}

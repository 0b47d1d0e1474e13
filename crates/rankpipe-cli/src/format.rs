//! Output formatting for the CLI.
//!
//! Raw mode prints what the pipeline wrote; JSON mode prints a [`Report`] for
//! scripts and tools that want stdout, stderr and the exit status together.

use std::process::ExitCode;

use anyhow::Result;
use serde::Serialize;

use rankpipe_kernel::{Captured, ExitStatus};
use rankpipe_types::shell_quote;

/// Machine-readable result of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub out: Option<String>,
    pub err: Option<String>,
    /// Exit code, negative for a signal; absent if the last stage was never reaped.
    pub code: Option<i32>,
    pub status: Option<ExitStatus>,
}

impl Report {
    pub fn new(captured: &Captured, status: Option<ExitStatus>) -> Self {
        Self {
            out: captured.out.clone(),
            err: captured.err.clone(),
            code: status.map(ExitStatus::code),
            status,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Process exit code for the CLI itself, shell conventions for signals.
pub fn exit_code(status: Option<ExitStatus>) -> ExitCode {
    match status {
        Some(status) => ExitCode::from(status.shell_code().clamp(0, 255) as u8),
        None => ExitCode::FAILURE,
    }
}

/// Render a launcher argument list, either as one copy-pastable shell line
/// or as a JSON array.
pub fn render_args(args: &[String], json: bool) -> Result<String> {
    if json {
        Ok(serde_json::to_string(args)?)
    } else {
        Ok(args.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" "))
    }
}

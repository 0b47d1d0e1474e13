//! Kernel error types.

use thiserror::Error;

use rankpipe_types::GroupError;

use crate::arglist::CompileError;

/// Result type for kernel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from compiling, launching, or driving processes.
///
/// A child that fails to exec is *not* an error here: it surfaces as exit
/// status 127 (not found) or 126 (not executable) of that child.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid rank group: {0}")]
    Group(#[from] GroupError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("pipeline has no stages")]
    EmptyPipeline,
    /// Raised for launches attempted after the registry was shut down.
    #[error("no more processes: registry has been shut down")]
    NoMoreProcesses,
}

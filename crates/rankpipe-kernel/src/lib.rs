//! rankpipe-kernel: compile rank trees, launch processes, drive their I/O.
//!
//! This crate provides:
//!
//! - **Argument lists**: flatten a [`RankGroup`] into a launcher command line
//!   with `%(world)d` / `%(n)d` decorations
//! - **Launcher**: fork/exec with pipes, stream merging, signal reset
//! - **Driver**: `manage()`, a non-blocking read/write/wait loop with a
//!   force-close grace period
//! - **Pipelines**: chain program descriptions with `|`, then `communicate()`
//! - **Registry**: per-thread bookkeeping of live children for interrupt
//!   handling (`kill_all`, `kill_for_thread`)
//!
//! ```text
//!   RankGroup ──to_arg_list──▶ argv ──launch──▶ Pid + fds ──manage──▶ out, err, statuses
//!                                                  │
//!                                          ProcessRegistry
//! ```

pub mod arglist;
pub mod config;
pub mod error;
pub mod launch;
pub mod launcher;
pub mod manage;
pub mod pipeline;
pub mod program;
pub mod registry;

pub use arglist::{ArgListOptions, CompileError, RankFlags, ShellValidator, substitute, to_arg_list};
pub use config::{DEFAULT_FORCE_CLOSE, DEFAULT_KILL_AFTER, FORCE_CLOSE_ENV, ManageConfig};
pub use error::{Error, Result};
pub use launch::{EXIT_NOT_EXECUTABLE, EXIT_NOT_FOUND, Env, LaunchRequest, Launched, Stdio, launch, resolve_in_path};
pub use launcher::{LaunchedGroup, Launcher};
pub use manage::{Managed, StreamKind, WorkList, manage};
pub use pipeline::{Captured, Pipeline, PipelineBuilder, PipelineOptions};
pub use program::{Chain, Command, ProgramDescription};
pub use registry::{OwnerHandle, ProcessRegistry, kill_all, kill_for_thread};

// Re-exported so callers need no direct `nix` or `rankpipe-types` dependency
// for the common types.
pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
pub use rankpipe_types::{ExitStatus, GroupError, Rank, RankGroup, Turbo};
